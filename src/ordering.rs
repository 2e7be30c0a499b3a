//! Per-key ordering workers.
//!
//! Every `(channel, user)` key gets its own tokio task that owns an
//! [`OrderingGate`]. Events reach the task through a bounded mpsc
//! channel; the task offers them to the gate, ticks it every `tick_ms`,
//! and hands whatever the gate releases to a [`ReleaseSink`].
//!
//! ```text
//! dispatch(ev) ──▶ [key → sender] ──▶ worker(key) ──gate──▶ sink.deliver
//!                                        ▲   │
//!                                  tick ─┘   └──▶ sink.warn
//! ```
//!
//! The key map is locked only long enough to find or create a sender.
//! Keys never wait on each other.
//!
//! A worker with nothing buffered and no input for the idle timeout
//! retires: it leaves the map and closes its inbox under the map lock, so
//! the next event for its key starts a fresh worker that resumes from the
//! sink. Idle keys hold no task and no gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use rapport_core::error::PipelineWarning;
use rapport_core::gate::{GateOutput, GateSettings, OrderingGate};
use rapport_core::models::{CanonicalEvent, OrderingKey};

/// Receives what the gates release.
#[async_trait]
pub trait ReleaseSink: Send + Sync {
    /// Called in release order for one key.
    async fn deliver(&self, event: CanonicalEvent);

    fn warn(&self, warning: PipelineWarning);

    fn duplicates(&self, _count: usize) {}

    /// Highest sequence already applied for `key` and the originals
    /// already applied in its channel.
    async fn resume_point(&self, key: &OrderingKey) -> (Option<u64>, Vec<String>);
}

enum Command {
    Event(CanonicalEvent),
    /// Expire whatever has outlived the window, then acknowledge.
    Flush(oneshot::Sender<()>),
    /// Release everything still waiting, then acknowledge.
    Drain(oneshot::Sender<()>),
}

struct Worker {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
    generation: u64,
}

type Registry = Arc<Mutex<HashMap<OrderingKey, Worker>>>;

/// A worker's claim on its map entry.
struct Lease {
    registry: Registry,
    generation: u64,
    idle: Option<Duration>,
}

impl Lease {
    /// Leave the map and close the inbox if the entry is still ours and
    /// nothing is queued.
    fn retire(&self, key: &OrderingKey, rx: &mut mpsc::Receiver<Command>) -> bool {
        let mut workers = self.registry.lock();
        let ours = workers
            .get(key)
            .is_some_and(|w| w.generation == self.generation);
        if !ours || !rx.is_empty() {
            return false;
        }
        workers.remove(key);
        rx.close();
        true
    }
}

pub struct OrderingDispatcher {
    settings: GateSettings,
    tick: Duration,
    capacity: usize,
    idle: Option<Duration>,
    sink: Arc<dyn ReleaseSink>,
    workers: Registry,
    generations: AtomicU64,
    started: Instant,
}

impl OrderingDispatcher {
    pub fn new(
        settings: GateSettings,
        tick: Duration,
        capacity: usize,
        sink: Arc<dyn ReleaseSink>,
    ) -> Self {
        Self {
            settings,
            tick,
            capacity: capacity.max(1),
            idle: None,
            sink,
            workers: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Retire workers idle for `idle`. Zero keeps them forever.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = (!idle.is_zero()).then_some(idle);
        self
    }

    /// Route `event` to its key's worker, starting one if needed.
    ///
    /// Waits only when that key's queue is full.
    pub async fn dispatch(&self, event: CanonicalEvent) -> Result<()> {
        let key = event.ordering_key();
        let mut cmd = Command::Event(event);
        // A worker may retire between lookup and send; retry once on a new one.
        for _ in 0..2 {
            let tx = {
                let mut workers = self.workers.lock();
                let tx = self.sender_for(&mut workers, &key);
                match tx.try_send(cmd) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(c)) => {
                        cmd = c;
                        tx
                    }
                    Err(TrySendError::Closed(c)) => {
                        cmd = c;
                        workers.remove(&key);
                        continue;
                    }
                }
            };
            match tx.send(cmd).await {
                Ok(()) => return Ok(()),
                Err(SendError(c)) => cmd = c,
            }
        }
        Err(anyhow!("ordering worker for {} has stopped", key))
    }

    /// Number of keys with a live worker.
    pub fn active_keys(&self) -> usize {
        self.workers.lock().len()
    }

    /// Wait until every worker has processed what was dispatched before
    /// this call and has expired its window.
    pub async fn flush(&self) {
        self.barrier(Command::Flush).await;
    }

    /// Like [`flush`](Self::flush), but also releases every buffered and
    /// parked event.
    pub async fn drain(&self) {
        self.barrier(Command::Drain).await;
    }

    /// Drain all workers and stop them.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for w in workers {
            drop(w.tx);
            if let Err(e) = w.handle.await {
                tracing::error!("ordering worker panicked: {}", e);
            }
        }
    }

    async fn barrier(&self, make: fn(oneshot::Sender<()>) -> Command) {
        let senders: Vec<mpsc::Sender<Command>> =
            self.workers.lock().values().map(|w| w.tx.clone()).collect();
        let mut acks = Vec::with_capacity(senders.len());
        for tx in senders {
            let (done, ack) = oneshot::channel();
            if tx.send(make(done)).await.is_ok() {
                acks.push(ack);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    fn sender_for(
        &self,
        workers: &mut HashMap<OrderingKey, Worker>,
        key: &OrderingKey,
    ) -> mpsc::Sender<Command> {
        if let Some(w) = workers.get(key) {
            if !w.tx.is_closed() {
                return w.tx.clone();
            }
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let lease = Lease {
            registry: Arc::clone(&self.workers),
            generation,
            idle: self.idle,
        };
        let handle = tokio::spawn(run_worker(
            OrderingGate::new(key.clone(), self.settings.clone()),
            rx,
            self.tick,
            self.started,
            Arc::clone(&self.sink),
            lease,
        ));
        workers.insert(
            key.clone(),
            Worker {
                tx: tx.clone(),
                handle,
                generation,
            },
        );
        tx
    }
}

async fn run_worker(
    mut gate: OrderingGate,
    mut rx: mpsc::Receiver<Command>,
    tick: Duration,
    started: Instant,
    sink: Arc<dyn ReleaseSink>,
    lease: Lease,
) {
    let (after_seq, originals) = sink.resume_point(gate.key()).await;
    gate.resume(after_seq, originals);
    tracing::debug!(key = %gate.key(), ?after_seq, "ordering worker started");

    let now_ms = || started.elapsed().as_millis() as u64;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_input = Instant::now();

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => {
                    last_input = Instant::now();
                    handle(&mut gate, cmd, now_ms(), sink.as_ref()).await;
                }
                None => break,
            },
            _ = interval.tick() => {
                if gate.waiting() > 0 {
                    let out = gate.tick(now_ms());
                    emit(sink.as_ref(), out).await;
                } else if lease.idle.is_some_and(|idle| last_input.elapsed() >= idle)
                    && lease.retire(gate.key(), &mut rx)
                {
                    // Sends that won a permit before the close still land.
                    while let Some(cmd) = rx.recv().await {
                        handle(&mut gate, cmd, now_ms(), sink.as_ref()).await;
                    }
                    tracing::debug!(key = %gate.key(), "ordering worker retired");
                    break;
                }
            }
        }
    }

    let out = gate.expire_all();
    emit(sink.as_ref(), out).await;
    tracing::debug!(key = %gate.key(), "ordering worker stopped");
}

async fn handle(gate: &mut OrderingGate, cmd: Command, now_ms: u64, sink: &dyn ReleaseSink) {
    match cmd {
        Command::Event(event) => {
            let out = gate.offer(event, now_ms);
            emit(sink, out).await;
        }
        Command::Flush(done) => {
            let out = gate.tick(now_ms);
            emit(sink, out).await;
            let _ = done.send(());
        }
        Command::Drain(done) => {
            let out = gate.expire_all();
            emit(sink, out).await;
            let _ = done.send(());
        }
    }
}

async fn emit(sink: &dyn ReleaseSink, out: GateOutput) {
    if out.is_empty() {
        return;
    }
    if out.duplicates > 0 {
        sink.duplicates(out.duplicates);
    }
    for warning in out.warnings {
        sink.warn(warning);
    }
    for event in out.released {
        sink.deliver(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::models::{EventKind, EventPayload};

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
        applied: Mutex<HashMap<OrderingKey, u64>>,
        warnings: Mutex<Vec<&'static str>>,
        dups: Mutex<usize>,
        resume: Option<(u64, Vec<String>)>,
    }

    #[async_trait]
    impl ReleaseSink for Recorder {
        async fn deliver(&self, event: CanonicalEvent) {
            if let Some(seq) = event.sequence {
                let mut applied = self.applied.lock();
                let top = applied.entry(event.ordering_key()).or_insert(seq);
                *top = (*top).max(seq);
            }
            self.delivered.lock().push(event.event_id);
        }
        fn warn(&self, warning: PipelineWarning) {
            self.warnings.lock().push(warning.code());
        }
        fn duplicates(&self, count: usize) {
            *self.dups.lock() += count;
        }
        async fn resume_point(&self, key: &OrderingKey) -> (Option<u64>, Vec<String>) {
            match &self.resume {
                Some((seq, ids)) => (Some(*seq), ids.clone()),
                None => (self.applied.lock().get(key).copied(), Vec::new()),
            }
        }
    }

    fn post(user: &str, seq: u64) -> CanonicalEvent {
        CanonicalEvent {
            event_id: format!("msg:C1:{}-{}", user, seq),
            channel_id: "C1".into(),
            user_id: user.into(),
            kind: EventKind::Post,
            logical_timestamp: seq as i64 * 1_000_000,
            sequence: Some(seq),
            payload: EventPayload::Text {
                text: format!("message {}", seq),
            },
            supersedes: None,
        }
    }

    fn dispatcher(sink: Arc<Recorder>) -> OrderingDispatcher {
        OrderingDispatcher::new(GateSettings::default(), Duration::from_millis(10), 16, sink)
    }

    #[tokio::test]
    async fn reorders_within_a_key() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&sink));
        for seq in [2, 3, 1] {
            d.dispatch(post("U1", seq)).await.unwrap();
        }
        d.flush().await;
        assert_eq!(
            *sink.delivered.lock(),
            vec!["msg:C1:U1-1", "msg:C1:U1-2", "msg:C1:U1-3"]
        );
        assert!(sink.warnings.lock().is_empty());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&sink));
        d.dispatch(post("U1", 2)).await.unwrap();
        d.dispatch(post("U2", 1)).await.unwrap();
        d.flush().await;
        assert_eq!(*sink.delivered.lock(), vec!["msg:C1:U2-1"]);
        assert_eq!(d.active_keys(), 2);

        d.drain().await;
        assert_eq!(sink.delivered.lock().len(), 2);
        assert_eq!(*sink.warnings.lock(), vec!["gap_detected"]);
    }

    #[tokio::test]
    async fn duplicates_are_reported() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&sink));
        d.dispatch(post("U1", 1)).await.unwrap();
        d.dispatch(post("U1", 1)).await.unwrap();
        d.flush().await;
        assert_eq!(sink.delivered.lock().len(), 1);
        assert_eq!(*sink.dups.lock(), 1);
    }

    #[tokio::test]
    async fn worker_resumes_after_applied_sequence() {
        let sink = Arc::new(Recorder {
            resume: Some((4, Vec::new())),
            ..Recorder::default()
        });
        let d = dispatcher(Arc::clone(&sink));
        d.dispatch(post("U1", 5)).await.unwrap();
        d.flush().await;
        assert_eq!(*sink.delivered.lock(), vec!["msg:C1:U1-5"]);
    }

    #[tokio::test]
    async fn shutdown_releases_buffered_events() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&sink));
        d.dispatch(post("U1", 3)).await.unwrap();
        d.shutdown().await;
        assert_eq!(*sink.delivered.lock(), vec!["msg:C1:U1-3"]);
        assert_eq!(d.active_keys(), 0);
    }

    async fn wait_for_idle(d: &OrderingDispatcher) {
        for _ in 0..200 {
            if d.active_keys() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn idle_workers_retire_and_resume() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&sink)).with_idle_timeout(Duration::from_millis(30));
        d.dispatch(post("U1", 1)).await.unwrap();
        d.dispatch(post("U2", 1)).await.unwrap();
        d.flush().await;
        assert_eq!(d.active_keys(), 2);

        wait_for_idle(&d).await;
        assert_eq!(d.active_keys(), 0);

        // The replacement picks up after the applied sequence.
        d.dispatch(post("U1", 2)).await.unwrap();
        d.flush().await;
        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[2], "msg:C1:U1-2");
        assert!(sink.warnings.lock().is_empty());
        assert_eq!(d.active_keys(), 1);
    }

    #[tokio::test]
    async fn workers_with_buffered_events_do_not_retire() {
        let sink = Arc::new(Recorder::default());
        let settings = GateSettings {
            window_ms: 60_000,
            ..GateSettings::default()
        };
        let d = OrderingDispatcher::new(
            settings,
            Duration::from_millis(10),
            16,
            Arc::clone(&sink) as Arc<dyn ReleaseSink>,
        )
        .with_idle_timeout(Duration::from_millis(20));
        d.dispatch(post("U1", 3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(d.active_keys(), 1);
        assert!(sink.delivered.lock().is_empty());

        d.dispatch(post("U1", 1)).await.unwrap();
        d.dispatch(post("U1", 2)).await.unwrap();
        d.flush().await;
        assert_eq!(sink.delivered.lock().len(), 3);
    }
}
