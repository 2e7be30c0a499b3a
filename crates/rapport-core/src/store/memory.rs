//! In-memory storage backends.
//!
//! Used by tests, by `[db] backend = "memory"`, and anywhere durability is
//! not wanted. State lives behind `parking_lot::RwLock`. Vector search is
//! brute-force cosine similarity over the valid chunks.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_similarity;
use crate::lineage::{decide, Decision, LineageHead, Revision, RevisionKind, RevisionOutcome};
use crate::models::{CanonicalEvent, IndexedChunk, ScoredChunk, UserProfile};
use crate::profile::{ProfileDelta, ProfileState};

use super::{EventLog, IndexStats, ProfileStore, QueryScope, VectorIndex};

#[derive(Default)]
struct LogState {
    events: Vec<CanonicalEvent>,
    ids: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryEventLog {
    state: RwLock<LogState>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: &CanonicalEvent) -> Result<bool> {
        let mut state = self.state.write();
        if !state.ids.insert(event.event_id.clone()) {
            return Ok(false);
        }
        state.events.push(event.clone());
        Ok(true)
    }

    async fn replay(&self) -> Result<Vec<CanonicalEvent>> {
        Ok(self.state.read().events.clone())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.state.read().events.len() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<BTreeMap<String, ProfileState>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load_profile(&self, user_id: &str) -> Result<Option<ProfileState>> {
        Ok(self.profiles.read().get(user_id).cloned())
    }

    async fn save_profile(&self, state: &ProfileState) -> Result<()> {
        self.profiles
            .write()
            .insert(state.profile.user_id.clone(), state.clone());
        Ok(())
    }

    async fn save_delta(&self, profile: &UserProfile, delta: &ProfileDelta) -> Result<()> {
        let mut profiles = self.profiles.write();
        let state = profiles
            .entry(profile.user_id.clone())
            .or_insert_with(|| ProfileState::new(&profile.user_id));
        state.profile = profile.clone();
        state.ledger.record(delta);
        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<String>> {
        Ok(self.profiles.read().keys().cloned().collect())
    }
}

#[derive(Default)]
struct IndexState {
    chunks: Vec<IndexedChunk>,
    /// Position of each chunk id in `chunks`.
    by_id: HashMap<String, usize>,
    heads: HashMap<String, LineageHead>,
}

impl IndexState {
    fn invalidate_lineage(&mut self, lineage_id: &str) -> usize {
        let mut n = 0;
        for c in self
            .chunks
            .iter_mut()
            .filter(|c| c.lineage_id == lineage_id && c.valid)
        {
            c.valid = false;
            n += 1;
        }
        n
    }

    fn insert(&mut self, chunk: IndexedChunk) {
        match self.by_id.get(&chunk.chunk_id) {
            Some(&pos) => self.chunks[pos] = chunk,
            None => {
                self.by_id.insert(chunk.chunk_id.clone(), self.chunks.len());
                self.chunks.push(chunk);
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryVectorIndex {
    state: RwLock<IndexState>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn apply_revision(&self, revision: Revision) -> Result<RevisionOutcome> {
        let mut state = self.state.write();
        let decision = decide(state.heads.get(&revision.lineage_id), &revision);
        let head = revision.head();

        let outcome = match (decision, revision.kind) {
            (Decision::Stale, _) => RevisionOutcome::Stale,
            (Decision::Tombstone, _) => RevisionOutcome::Deleted {
                invalidated: state.invalidate_lineage(&revision.lineage_id),
            },
            (Decision::Replace, RevisionKind::Replace(chunks)) => {
                let invalidated = state.invalidate_lineage(&revision.lineage_id);
                let inserted = chunks.len();
                for c in chunks {
                    state.insert(c);
                }
                RevisionOutcome::Applied {
                    invalidated,
                    inserted,
                }
            }
            (Decision::Replace, RevisionKind::Tombstone) => RevisionOutcome::Stale,
        };

        if outcome != RevisionOutcome::Stale {
            state.heads.insert(revision.lineage_id, head);
        }
        Ok(outcome)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        scope: &QueryScope,
    ) -> Result<Vec<ScoredChunk>> {
        let state = self.state.read();
        let mut scored: Vec<ScoredChunk> = state
            .chunks
            .iter()
            .filter(|c| c.valid && scope.matches(c))
            .map(|c| ScoredChunk {
                similarity: cosine_similarity(vector, &c.embedding),
                chunk: c.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn chunks_for_lineage(&self, lineage_id: &str) -> Result<Vec<IndexedChunk>> {
        let state = self.state.read();
        let mut out: Vec<IndexedChunk> = state
            .chunks
            .iter()
            .filter(|c| c.lineage_id == lineage_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.revision_ts, c.offset));
        Ok(out)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read();
        Ok(IndexStats {
            total_chunks: state.chunks.len() as u64,
            valid_chunks: state.chunks.iter().filter(|c| c.valid).count() as u64,
            lineages: state.heads.len() as u64,
            tombstoned_lineages: state.heads.values().filter(|h| h.deleted).count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::embedding::HashingEmbedder;
    use crate::models::{EventKind, EventPayload};

    fn revision(src: &str, ts: i64, text: &str) -> Revision {
        let e = HashingEmbedder::new(32);
        let chunks = chunk_text(src, text, 128);
        let vectors = chunks.iter().map(|c| e.embed(&c.text)).collect();
        Revision::replace("msg:C1:1", src, ts, Some("U1"), Some("C1"), chunks, vectors)
    }

    #[tokio::test]
    async fn edit_replaces_post_in_either_order() {
        for order in [[0usize, 1], [1, 0]] {
            let index = InMemoryVectorIndex::new();
            let revs = [
                revision("msg:C1:1", 1, "We shipped the billing fix"),
                revision("edit:C1:1:2", 2, "We shipped the billing fix today"),
            ];
            for i in order {
                index.apply_revision(revs[i].clone()).await.unwrap();
            }
            let chunks = index.chunks_for_lineage("msg:C1:1").await.unwrap();
            let valid: Vec<&IndexedChunk> = chunks.iter().filter(|c| c.valid).collect();
            assert_eq!(valid.len(), 1);
            assert_eq!(valid[0].text, "We shipped the billing fix today");
        }
    }

    #[tokio::test]
    async fn tombstone_hides_lineage_from_queries() {
        let index = InMemoryVectorIndex::new();
        index
            .apply_revision(revision("msg:C1:1", 1, "billing fix"))
            .await
            .unwrap();
        let outcome = index
            .apply_revision(Revision::tombstone("msg:C1:1", "del:C1:1", 3))
            .await
            .unwrap();
        assert_eq!(outcome, RevisionOutcome::Deleted { invalidated: 1 });

        let q = HashingEmbedder::new(32).embed("billing fix");
        let hits = index.query(&q, 10, &QueryScope::workspace()).await.unwrap();
        assert!(hits.is_empty());

        let late = index
            .apply_revision(revision("edit:C1:1:2", 2, "billing fix v2"))
            .await
            .unwrap();
        assert_eq!(late, RevisionOutcome::Stale);
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.valid_chunks, 0);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.tombstoned_lineages, 1);
    }

    #[tokio::test]
    async fn query_respects_scope_and_limit() {
        let index = InMemoryVectorIndex::new();
        let e = HashingEmbedder::new(32);
        for (i, user) in [Some("U1"), Some("U2"), None].into_iter().enumerate() {
            let src = format!("msg:C1:{}", i);
            let chunks = chunk_text(&src, "deploy notes", 128);
            let vectors = chunks.iter().map(|c| e.embed(&c.text)).collect();
            let rev = Revision::replace(&src, &src, 1, user, Some("C1"), chunks, vectors);
            index.apply_revision(rev).await.unwrap();
        }
        let q = e.embed("deploy");
        assert_eq!(index.query(&q, 10, &QueryScope::workspace()).await.unwrap().len(), 3);
        assert_eq!(index.query(&q, 2, &QueryScope::workspace()).await.unwrap().len(), 2);
        assert_eq!(index.query(&q, 10, &QueryScope::user("U1", false)).await.unwrap().len(), 1);
        assert_eq!(index.query(&q, 10, &QueryScope::user("U1", true)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn event_log_dedups_by_id() {
        let log = InMemoryEventLog::new();
        let ev = CanonicalEvent {
            event_id: "msg:C1:1".into(),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            kind: EventKind::Post,
            logical_timestamp: 1,
            sequence: None,
            payload: EventPayload::Text { text: "hi".into() },
            supersedes: None,
        };
        assert!(log.append(&ev).await.unwrap());
        assert!(!log.append(&ev).await.unwrap());
        assert_eq!(log.count().await.unwrap(), 1);
        assert_eq!(log.replay().await.unwrap(), vec![ev]);
    }

    #[tokio::test]
    async fn profile_store_roundtrip() {
        let store = InMemoryProfileStore::new();
        assert!(store.load_profile("U1").await.unwrap().is_none());
        store.save_profile(&ProfileState::new("U2")).await.unwrap();
        store.save_profile(&ProfileState::new("U1")).await.unwrap();
        assert_eq!(store.list_profiles().await.unwrap(), vec!["U1", "U2"]);
        assert!(store.load_profile("U1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deltas_accumulate_into_the_stored_state() {
        use crate::models::{message_event_id, EventKind, EventPayload};
        use crate::profile::ProfileSettings;
        use crate::topics::KeywordTopicExtractor;

        let store = InMemoryProfileStore::new();
        let ex = KeywordTopicExtractor::default();
        let mut state = ProfileState::new("U1");
        for ts in [100, 200] {
            let post = CanonicalEvent {
                event_id: message_event_id("C1", &ts.to_string()),
                channel_id: "C1".into(),
                user_id: "U1".into(),
                kind: EventKind::Post,
                logical_timestamp: ts,
                sequence: None,
                payload: EventPayload::Text {
                    text: "billing rollout".into(),
                },
                supersedes: None,
            };
            let (_, delta) = state.apply_tracked(&post, &ex, &ProfileSettings::default());
            let delta = delta.unwrap();
            store.save_delta(&state.profile, &delta).await.unwrap();
        }
        assert_eq!(store.load_profile("U1").await.unwrap(), Some(state));
    }
}
