//! Content indexer: chunk, embed, and store message text off the
//! ordering path.
//!
//! # Queueing
//!
//! ```text
//! enqueue ──try_send──▶ [bounded mpsc] ──▶ worker ──embed──▶ VectorIndex
//!    │ full                                  ▲
//!    └──▶ [capped backlog] ──────────────────┘
//!           │ full
//!           └──▶ IndexBacklogFull (recover with `rapport replay`)
//! ```
//!
//! [`ContentIndexer::enqueue`] never awaits, so the ordering workers are
//! never held up by a slow embedding provider. A single worker processes
//! jobs; each job is retried with exponential backoff before an
//! `IndexFailed` warning is raised. Jobs for one message may complete
//! out of order; [`rapport_core::lineage::decide`] keeps the newest
//! revision regardless.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use rapport_core::chunk::chunk_text;
use rapport_core::error::PipelineWarning;
use rapport_core::lineage::{Revision, RevisionOutcome};
use rapport_core::models::{CanonicalEvent, EventKind};
use rapport_core::store::VectorIndex;

use crate::config::IndexerConfig;
use crate::embedding::{embed_batched, EmbeddingProvider};
use crate::stats::{add, bump, PipelineStats};

#[derive(Debug, Clone)]
pub enum IndexJob {
    Event(CanonicalEvent),
    Document {
        /// Path relative to the indexed root.
        path: String,
        text: String,
        /// Modification time in microseconds.
        modified_ts: i64,
    },
}

impl IndexJob {
    fn source_id(&self) -> String {
        match self {
            IndexJob::Event(e) => e.event_id.clone(),
            IndexJob::Document {
                path, modified_ts, ..
            } => document_source_id(path, *modified_ts),
        }
    }
}

/// Whether indexing `event` could change the index.
pub fn is_indexable(event: &CanonicalEvent) -> bool {
    match event.kind {
        EventKind::Post | EventKind::Edit => event.text().is_some(),
        EventKind::Delete => event.supersedes.is_some(),
        _ => false,
    }
}

pub fn document_lineage(path: &str) -> String {
    format!("doc:{}", path)
}

fn document_source_id(path: &str, modified_ts: i64) -> String {
    format!("doc:{}@{}", path, modified_ts)
}

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub queue_capacity: usize,
    pub backlog_capacity: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_tokens: usize,
    pub batch_size: usize,
}

impl IndexerSettings {
    pub fn from_config(indexer: &IndexerConfig, max_tokens: usize, batch_size: usize) -> Self {
        Self {
            queue_capacity: indexer.queue_capacity,
            backlog_capacity: indexer.backlog_capacity,
            max_retries: indexer.max_retries,
            base_backoff: Duration::from_millis(indexer.base_backoff_ms),
            max_backoff: Duration::from_millis(indexer.max_backoff_ms),
            max_tokens,
            batch_size,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

struct Inner {
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    settings: IndexerSettings,
    stats: Arc<PipelineStats>,
    backlog: Mutex<VecDeque<IndexJob>>,
    wake: Notify,
    pending: AtomicUsize,
    idle: Notify,
}

pub struct ContentIndexer {
    inner: Arc<Inner>,
    tx: Mutex<Option<mpsc::Sender<IndexJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContentIndexer {
    /// Start the indexer and its worker task.
    pub fn start(
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: IndexerSettings,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let inner = Arc::new(Inner {
            index,
            provider,
            settings,
            stats,
            backlog: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&inner), rx));
        Self {
            inner,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `job` without waiting. Returns `false` when the job was
    /// dropped.
    pub fn enqueue(&self, job: IndexJob) -> bool {
        if let IndexJob::Event(e) = &job {
            if !is_indexable(e) {
                return true;
            }
        }
        let Some(tx) = self.tx.lock().clone() else {
            return false;
        };

        let inner = &self.inner;
        inner.pending.fetch_add(1, Ordering::SeqCst);
        bump(&inner.stats.index_jobs_enqueued);

        let job = match tx.try_send(job) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(job)) => job,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.finish_one();
                return false;
            }
        };

        let mut backlog = inner.backlog.lock();
        if backlog.len() < inner.settings.backlog_capacity {
            backlog.push_back(job);
            drop(backlog);
            inner.wake.notify_one();
            true
        } else {
            drop(backlog);
            inner.stats.warn(&PipelineWarning::IndexBacklogFull {
                source_event_id: job.source_id(),
            });
            inner.finish_one();
            false
        }
    }

    /// Jobs queued or in progress.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued job has been processed.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Process a job on the caller's task, bypassing the queue.
    pub async fn index_now(&self, job: IndexJob) -> Result<RevisionOutcome> {
        self.inner.index_job(&job).await
    }

    /// Finish queued work and stop the worker.
    pub async fn shutdown(&self) {
        self.flush().await;
        drop(self.tx.lock().take());
        self.inner.wake.notify_one();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!("index worker panicked: {}", e);
            }
        }
    }
}

impl Inner {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, job: IndexJob) {
        let source = job.source_id();
        let mut attempt = 0u32;
        loop {
            match self.index_job(&job).await {
                Ok(outcome) => {
                    tracing::debug!(source = %source, ?outcome, "indexed");
                    break;
                }
                Err(e) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = self.settings.backoff(attempt);
                    tracing::debug!(
                        source = %source,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "index retry: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.stats.warn(&PipelineWarning::IndexFailed {
                        source_event_id: source,
                        attempts: attempt + 1,
                        message: format!("{:#}", e),
                    });
                    break;
                }
            }
        }
        bump(&self.stats.index_jobs_completed);
        self.finish_one();
    }

    async fn index_job(&self, job: &IndexJob) -> Result<RevisionOutcome> {
        let revision = match job {
            IndexJob::Event(event) => self.event_revision(event).await?,
            IndexJob::Document {
                path,
                text,
                modified_ts,
            } => {
                let source = document_source_id(path, *modified_ts);
                self.replace_revision(
                    &document_lineage(path),
                    &source,
                    *modified_ts,
                    None,
                    None,
                    text,
                )
                .await?
            }
        };

        let outcome = self.index.apply_revision(revision).await?;
        match outcome {
            RevisionOutcome::Applied {
                invalidated,
                inserted,
            } => {
                add(&self.stats.chunks_invalidated, invalidated as u64);
                add(&self.stats.chunks_inserted, inserted as u64);
            }
            RevisionOutcome::Deleted { invalidated } => {
                add(&self.stats.chunks_invalidated, invalidated as u64);
            }
            RevisionOutcome::Stale => {}
        }
        Ok(outcome)
    }

    async fn event_revision(&self, event: &CanonicalEvent) -> Result<Revision> {
        let lineage = event
            .lineage_id()
            .ok_or_else(|| anyhow!("{} has no lineage", event.event_id))?
            .to_string();
        match event.kind {
            EventKind::Delete => Ok(Revision::tombstone(
                &lineage,
                &event.event_id,
                event.logical_timestamp,
            )),
            _ => {
                self.replace_revision(
                    &lineage,
                    &event.event_id,
                    event.logical_timestamp,
                    Some(&event.user_id),
                    Some(&event.channel_id),
                    event.text().unwrap_or_default(),
                )
                .await
            }
        }
    }

    async fn replace_revision(
        &self,
        lineage: &str,
        source: &str,
        revision_ts: i64,
        user_id: Option<&str>,
        channel_id: Option<&str>,
        text: &str,
    ) -> Result<Revision> {
        let chunks = chunk_text(source, text, self.settings.max_tokens);
        let vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            embed_batched(self.provider.as_ref(), &texts, self.settings.batch_size).await?
        };
        Ok(Revision::replace(
            lineage,
            source,
            revision_ts,
            user_id,
            channel_id,
            chunks,
            vectors,
        ))
    }
}

async fn run_worker(inner: Arc<Inner>, mut rx: mpsc::Receiver<IndexJob>) {
    let mut open = true;
    loop {
        let spilled = inner.backlog.lock().pop_front();
        if let Some(job) = spilled {
            inner.process(job).await;
            continue;
        }
        if !open {
            break;
        }
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => inner.process(job).await,
                None => open = false,
            },
            _ = inner.wake.notified() => {}
        }
    }
    tracing::debug!("index worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DisabledProvider, HashProvider};
    use rapport_core::embedding::HashingEmbedder;
    use rapport_core::models::EventPayload;
    use rapport_core::store::memory::InMemoryVectorIndex;
    use rapport_core::store::QueryScope;

    fn settings() -> IndexerSettings {
        IndexerSettings {
            queue_capacity: 4,
            backlog_capacity: 16,
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_tokens: 64,
            batch_size: 8,
        }
    }

    fn event(kind: EventKind, id: &str, ts: i64, text: Option<&str>) -> CanonicalEvent {
        CanonicalEvent {
            event_id: id.into(),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            kind,
            logical_timestamp: ts,
            sequence: None,
            payload: match text {
                Some(t) => EventPayload::Text { text: t.into() },
                None => EventPayload::Empty,
            },
            supersedes: (kind != EventKind::Post).then(|| "msg:C1:1.0".to_string()),
        }
    }

    async fn valid_texts(index: &InMemoryVectorIndex) -> Vec<String> {
        index
            .chunks_for_lineage("msg:C1:1.0")
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.valid)
            .map(|c| c.text)
            .collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = IndexerSettings {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3_000),
            ..settings()
        };
        assert_eq!(s.backoff(1), Duration::from_millis(500));
        assert_eq!(s.backoff(2), Duration::from_millis(1_000));
        assert_eq!(s.backoff(3), Duration::from_millis(2_000));
        assert_eq!(s.backoff(4), Duration::from_millis(3_000));
        assert_eq!(s.backoff(40), Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn edit_before_post_keeps_edit_text() {
        let index = Arc::new(InMemoryVectorIndex::new());
        let stats = Arc::new(PipelineStats::default());
        let indexer = ContentIndexer::start(
            index.clone(),
            Arc::new(HashProvider::new(32)),
            settings(),
            stats.clone(),
        );

        indexer.enqueue(IndexJob::Event(event(
            EventKind::Edit,
            "edit:C1:1.0:2.0",
            2,
            Some("edited text"),
        )));
        indexer.enqueue(IndexJob::Event(event(
            EventKind::Post,
            "msg:C1:1.0",
            1,
            Some("original text"),
        )));
        indexer.flush().await;

        assert_eq!(valid_texts(&index).await, vec!["edited text"]);
        assert_eq!(stats.snapshot().index_jobs_completed, 2);
    }

    #[tokio::test]
    async fn delete_hides_all_revisions() {
        let index = Arc::new(InMemoryVectorIndex::new());
        let indexer = ContentIndexer::start(
            index.clone(),
            Arc::new(HashProvider::new(32)),
            settings(),
            Arc::new(PipelineStats::default()),
        );
        indexer.enqueue(IndexJob::Event(event(EventKind::Post, "msg:C1:1.0", 1, Some("text"))));
        indexer.enqueue(IndexJob::Event(event(EventKind::Delete, "del:C1:1.0", 3, None)));
        indexer.enqueue(IndexJob::Event(event(
            EventKind::Edit,
            "edit:C1:1.0:2.0",
            2,
            Some("late edit"),
        )));
        indexer.flush().await;

        assert!(valid_texts(&index).await.is_empty());
        let hits = index
            .query(&HashingEmbedder::new(32).embed("late edit"), 10, &QueryScope::workspace())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn provider_failure_raises_index_failed() {
        let stats = Arc::new(PipelineStats::default());
        let indexer = ContentIndexer::start(
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(DisabledProvider),
            settings(),
            stats.clone(),
        );
        indexer.enqueue(IndexJob::Event(event(EventKind::Post, "msg:C1:1.0", 1, Some("text"))));
        indexer.flush().await;

        let snap = stats.snapshot();
        assert_eq!(snap.index_failures, 1);
        assert_eq!(indexer.pending(), 0);
    }

    #[tokio::test]
    async fn overflow_spills_then_drops() {
        let stats = Arc::new(PipelineStats::default());
        let indexer = ContentIndexer::start(
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(HashProvider::new(16)),
            IndexerSettings {
                queue_capacity: 1,
                backlog_capacity: 1,
                ..settings()
            },
            stats.clone(),
        );

        // The worker cannot run until this task yields.
        let mut accepted = 0;
        for i in 0..5 {
            let id = format!("msg:C1:{}.0", i);
            let ev = event(EventKind::Post, &id, i, Some("some text"));
            if indexer.enqueue(IndexJob::Event(ev)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
        indexer.flush().await;
        let snap = stats.snapshot();
        assert_eq!(snap.index_backlog_drops, 3);
        assert_eq!(snap.index_jobs_completed, 2);
    }

    #[tokio::test]
    async fn documents_have_no_author() {
        let index = Arc::new(InMemoryVectorIndex::new());
        let indexer = ContentIndexer::start(
            index.clone(),
            Arc::new(HashProvider::new(32)),
            settings(),
            Arc::new(PipelineStats::default()),
        );
        let outcome = indexer
            .index_now(IndexJob::Document {
                path: "handbook/oncall.md".into(),
                text: "Escalate to the on-call lead.".into(),
                modified_ts: 10,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, RevisionOutcome::Applied { inserted: 1, .. }));
        let chunks = index
            .chunks_for_lineage("doc:handbook/oncall.md")
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].user_id.is_none());

        let unchanged = indexer
            .index_now(IndexJob::Document {
                path: "handbook/oncall.md".into(),
                text: "Escalate to the on-call lead.".into(),
                modified_ts: 10,
            })
            .await
            .unwrap();
        assert_eq!(unchanged, RevisionOutcome::Stale);
    }

    #[tokio::test]
    async fn non_content_events_are_skipped() {
        let stats = Arc::new(PipelineStats::default());
        let indexer = ContentIndexer::start(
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(HashProvider::new(16)),
            settings(),
            stats.clone(),
        );
        let mut join = event(EventKind::Join, "join:C1:U1:1.0", 1, None);
        join.payload = EventPayload::Membership;
        join.supersedes = None;
        assert!(indexer.enqueue(IndexJob::Event(join)));
        assert_eq!(stats.snapshot().index_jobs_enqueued, 0);
        indexer.shutdown().await;
    }
}
