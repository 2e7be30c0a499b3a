//! Dedup and ordering gate for one (channel, user) key.
//!
//! The gate releases each post at most once, drops repeats of other recent
//! events, and within a bounded window releases events in sequence order.
//! It is a pure state machine: callers pass the current time in
//! milliseconds, and the runtime worker calls [`OrderingGate::tick`]
//! periodically to expire the window.
//!
//! # Release rules
//!
//! | Arrival | Action |
//! |---------|--------|
//! | id recently released, buffered, or parked | dropped, counted as duplicate |
//! | edit/delete, original released | released now |
//! | edit/delete, original unseen | parked until the original is released or `orphan_timeout_ms` passes |
//! | `sequence == next` | released, then buffered successors drain |
//! | `sequence > next` | buffered |
//! | `sequence < next` | released with `LateArrival` |
//! | no sequence | released; `LateArrival` if older than the newest released timestamp |
//!
//! Edits and deletes never sit in the reorder buffer. When they carry a
//! sequence, their position counts as filled so they do not open a gap.
//!
//! When the oldest buffered event exceeds `window_ms`, or the buffer holds
//! more than `window_slots` events, the whole buffer is released in
//! timestamp order with one `GapDetected` warning per missing range.
//!
//! Post ids are kept for the life of the gate because later supersessions
//! look them up. Every other released id is kept only in a window of the
//! last `recent_ids` releases; older repeats are left to downstream dedup.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::PipelineWarning;
use crate::models::{CanonicalEvent, EventKind, OrderingKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    pub window_slots: usize,
    pub window_ms: u64,
    pub orphan_timeout_ms: u64,
    /// Sequence expected first on a key with no history.
    pub first_sequence: u64,
    /// Non-post ids remembered for duplicate detection.
    pub recent_ids: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            window_slots: 32,
            window_ms: 2_000,
            orphan_timeout_ms: 30_000,
            first_sequence: 1,
            recent_ids: 1_024,
        }
    }
}

#[derive(Debug, Default)]
pub struct GateOutput {
    /// Events to apply downstream, in order.
    pub released: Vec<CanonicalEvent>,
    pub warnings: Vec<PipelineWarning>,
    pub duplicates: usize,
}

impl GateOutput {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.warnings.is_empty() && self.duplicates == 0
    }

    fn absorb(&mut self, other: GateOutput) {
        self.released.extend(other.released);
        self.warnings.extend(other.warnings);
        self.duplicates += other.duplicates;
    }
}

#[derive(Debug)]
struct Held {
    event: CanonicalEvent,
    arrived_ms: u64,
}

#[derive(Debug)]
pub struct OrderingGate {
    key: OrderingKey,
    settings: GateSettings,
    next_seq: u64,
    buffer: BTreeMap<u64, Held>,
    /// Positions above `next_seq` already taken by edits and deletes.
    filled: BTreeSet<u64>,
    /// Released post ids.
    originals: HashSet<String>,
    recent: HashSet<String>,
    recent_order: VecDeque<String>,
    pending: HashSet<String>,
    /// Supersessions waiting for their original, keyed by its id.
    parked: BTreeMap<String, Vec<Held>>,
    watermark_ts: Option<i64>,
}

impl OrderingGate {
    pub fn new(key: OrderingKey, settings: GateSettings) -> Self {
        let next_seq = settings.first_sequence;
        Self {
            key,
            settings,
            next_seq,
            buffer: BTreeMap::new(),
            filled: BTreeSet::new(),
            originals: HashSet::new(),
            recent: HashSet::new(),
            recent_order: VecDeque::new(),
            pending: HashSet::new(),
            parked: BTreeMap::new(),
            watermark_ts: None,
        }
    }

    /// Restore state persisted downstream: the highest sequence already
    /// applied and the originals already applied on this key.
    pub fn resume<I>(&mut self, after_seq: Option<u64>, applied_originals: I)
    where
        I: IntoIterator<Item = String>,
    {
        if let Some(seq) = after_seq {
            self.next_seq = self.next_seq.max(seq + 1);
        }
        self.originals.extend(applied_originals);
    }

    pub fn key(&self) -> &OrderingKey {
        &self.key
    }

    /// Events currently buffered or parked.
    pub fn waiting(&self) -> usize {
        self.buffer.len() + self.parked.values().map(Vec::len).sum::<usize>()
    }

    pub fn offer(&mut self, event: CanonicalEvent, now_ms: u64) -> GateOutput {
        let mut out = GateOutput::default();
        if self.seen(&event.event_id) {
            out.duplicates += 1;
            return out;
        }

        if event.kind.is_supersession() {
            if let Some(target) = event.supersedes.clone() {
                if let Some(seq) = event.sequence {
                    self.mark_filled(seq, &mut out);
                }
                if self.originals.contains(&target) {
                    self.release(event, &mut out);
                } else {
                    self.pending.insert(event.event_id.clone());
                    self.parked.entry(target).or_default().push(Held {
                        event,
                        arrived_ms: now_ms,
                    });
                }
                return out;
            }
        }

        match event.sequence {
            Some(seq) => self.offer_sequenced(seq, event, now_ms, &mut out),
            None => {
                if matches!(self.watermark_ts, Some(w) if event.logical_timestamp < w) {
                    out.warnings.push(self.late(&event));
                }
                self.release(event, &mut out);
            }
        }
        out
    }

    /// Expire the reorder window and orphaned supersessions.
    pub fn tick(&mut self, now_ms: u64) -> GateOutput {
        let mut out = GateOutput::default();

        let oldest = self.buffer.values().map(|h| h.arrived_ms).min();
        if let Some(oldest) = oldest {
            if now_ms.saturating_sub(oldest) >= self.settings.window_ms {
                self.flush_buffer(&mut out);
            }
        }

        let timeout = self.settings.orphan_timeout_ms;
        let targets: Vec<String> = self.parked.keys().cloned().collect();
        for target in targets {
            let Some(held) = self.parked.remove(&target) else {
                continue;
            };
            let (expired, waiting): (Vec<Held>, Vec<Held>) = held
                .into_iter()
                .partition(|h| now_ms.saturating_sub(h.arrived_ms) >= timeout);
            for h in expired {
                self.pending.remove(&h.event.event_id);
                out.warnings.push(PipelineWarning::OrphanSupersession {
                    event_id: h.event.event_id,
                    supersedes: target.clone(),
                });
            }
            if !waiting.is_empty() {
                self.parked.insert(target, waiting);
            }
        }

        out
    }

    /// Release everything buffered and drop every parked supersession.
    /// Used when the stream ends.
    pub fn expire_all(&mut self) -> GateOutput {
        let mut out = GateOutput::default();
        self.flush_buffer(&mut out);
        let parked = std::mem::take(&mut self.parked);
        for (target, held) in parked {
            for h in held {
                self.pending.remove(&h.event.event_id);
                out.warnings.push(PipelineWarning::OrphanSupersession {
                    event_id: h.event.event_id,
                    supersedes: target.clone(),
                });
            }
        }
        out
    }

    fn offer_sequenced(
        &mut self,
        seq: u64,
        event: CanonicalEvent,
        now_ms: u64,
        out: &mut GateOutput,
    ) {
        if seq == self.next_seq {
            self.release(event, out);
            self.next_seq = seq + 1;
            self.drain(out);
        } else if seq > self.next_seq && !self.buffer.contains_key(&seq) {
            self.pending.insert(event.event_id.clone());
            self.buffer.insert(
                seq,
                Held {
                    event,
                    arrived_ms: now_ms,
                },
            );
            if self.buffer.len() > self.settings.window_slots {
                self.flush_buffer(out);
            }
        } else {
            // Behind the window, or a position already claimed.
            out.warnings.push(self.late(&event));
            self.release(event, out);
        }
    }

    fn mark_filled(&mut self, seq: u64, out: &mut GateOutput) {
        if seq == self.next_seq {
            self.next_seq += 1;
            self.drain(out);
        } else if seq > self.next_seq {
            self.filled.insert(seq);
        }
    }

    fn drain(&mut self, out: &mut GateOutput) {
        loop {
            let n = self.next_seq;
            if let Some(held) = self.buffer.remove(&n) {
                self.pending.remove(&held.event.event_id);
                self.release(held.event, out);
            } else if !self.filled.remove(&n) {
                break;
            }
            self.next_seq = n + 1;
        }
        let next = self.next_seq;
        self.filled.retain(|s| *s >= next);
    }

    fn flush_buffer(&mut self, out: &mut GateOutput) {
        if self.buffer.is_empty() {
            return;
        }
        let buffer = std::mem::take(&mut self.buffer);

        let present: BTreeSet<u64> = buffer
            .keys()
            .copied()
            .chain(self.filled.iter().copied())
            .collect();
        let mut expected = self.next_seq;
        for &pos in &present {
            if pos > expected {
                out.warnings.push(PipelineWarning::GapDetected {
                    key: self.key.to_string(),
                    missing_from: expected,
                    missing_to: pos - 1,
                });
            }
            expected = expected.max(pos + 1);
        }
        self.next_seq = expected;
        self.filled.clear();

        let mut held: Vec<(u64, Held)> = buffer.into_iter().collect();
        held.sort_by(|(sa, a), (sb, b)| {
            a.event
                .logical_timestamp
                .cmp(&b.event.logical_timestamp)
                .then(sa.cmp(sb))
        });
        for (_, h) in held {
            self.pending.remove(&h.event.event_id);
            self.release(h.event, out);
        }
    }

    fn seen(&self, id: &str) -> bool {
        self.originals.contains(id) || self.recent.contains(id) || self.pending.contains(id)
    }

    fn remember(&mut self, id: String) {
        if self.settings.recent_ids == 0 || !self.recent.insert(id.clone()) {
            return;
        }
        self.recent_order.push_back(id);
        while self.recent_order.len() > self.settings.recent_ids {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent.remove(&old);
            }
        }
    }

    fn release(&mut self, event: CanonicalEvent, out: &mut GateOutput) {
        let id = event.event_id.clone();
        if event.kind == EventKind::Post {
            self.originals.insert(id.clone());
        } else {
            self.remember(id.clone());
        }
        self.watermark_ts = Some(
            self.watermark_ts
                .map_or(event.logical_timestamp, |w| w.max(event.logical_timestamp)),
        );
        out.released.push(event);

        if let Some(mut waiting) = self.parked.remove(&id) {
            waiting.sort_by_key(|h| h.event.logical_timestamp);
            let mut cascade = GateOutput::default();
            for h in waiting {
                self.pending.remove(&h.event.event_id);
                self.release(h.event, &mut cascade);
            }
            out.absorb(cascade);
        }
    }

    fn late(&self, event: &CanonicalEvent) -> PipelineWarning {
        PipelineWarning::LateArrival {
            event_id: event.event_id.clone(),
            key: self.key.to_string(),
        }
    }
}
