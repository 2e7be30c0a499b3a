//! Storage contracts for Rapport.
//!
//! Three traits separate the pipeline from its persistence engines:
//!
//! | Trait | Holds | Written by |
//! |-------|-------|------------|
//! | [`EventLog`] | every accepted canonical event, in arrival order | ingest |
//! | [`ProfileStore`] | one [`ProfileState`] per user | profile aggregator |
//! | [`VectorIndex`] | chunks, embeddings, lineage heads | content indexer |
//!
//! Implementations must be `Send + Sync` and safe under concurrent calls.
//! [`memory`] provides in-process backends. The `rapport` app crate adds a
//! SQLite backend implementing all three.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::lineage::{Revision, RevisionOutcome};
use crate::models::{CanonicalEvent, IndexedChunk, ScoredChunk, UserProfile};
use crate::profile::{ProfileDelta, ProfileState};

/// Append-only record of canonical events, used to rebuild projections.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Returns `false` when an event with the same id is already logged.
    async fn append(&self, event: &CanonicalEvent) -> Result<bool>;

    /// All events in append order.
    async fn replay(&self) -> Result<Vec<CanonicalEvent>>;

    async fn count(&self) -> Result<u64>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> Result<Option<ProfileState>>;

    /// Insert or replace the profile and its whole ledger.
    async fn save_profile(&self, state: &ProfileState) -> Result<()>;

    /// Persist one applied event: replace the profile, record the event as
    /// applied, and upsert only the ledger rows in `delta`.
    ///
    /// Cost depends on the delta, not on how many events the user has.
    async fn save_delta(&self, profile: &UserProfile, delta: &ProfileDelta) -> Result<()>;

    /// User ids with a stored profile, sorted.
    async fn list_profiles(&self) -> Result<Vec<String>>;
}

/// Which chunks a query may return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryScope {
    /// Restrict to chunks authored by this user.
    pub user_id: Option<String>,
    /// With `user_id` set, also return chunks that have no author
    /// (external documents).
    pub include_documents: bool,
}

impl QueryScope {
    pub fn workspace() -> Self {
        Self::default()
    }

    pub fn user(user_id: &str, include_documents: bool) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            include_documents,
        }
    }

    pub fn matches(&self, chunk: &IndexedChunk) -> bool {
        match (&self.user_id, &chunk.user_id) {
            (None, _) => true,
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => self.include_documents,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total_chunks: u64,
    pub valid_chunks: u64,
    pub lineages: u64,
    pub tombstoned_lineages: u64,
}

/// Chunk storage with lineage-aware supersession.
///
/// `apply_revision` must run [`lineage::decide`](crate::lineage::decide)
/// and carry out its decision atomically with respect to other revisions
/// of the same lineage.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn apply_revision(&self, revision: Revision) -> Result<RevisionOutcome>;

    /// Nearest valid chunks by cosine similarity, best first.
    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        scope: &QueryScope,
    ) -> Result<Vec<ScoredChunk>>;

    /// Every chunk of a lineage, valid or not, ordered by
    /// `(revision_ts, offset)`.
    async fn chunks_for_lineage(&self, lineage_id: &str) -> Result<Vec<IndexedChunk>>;

    async fn stats(&self) -> Result<IndexStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(user: Option<&str>) -> IndexedChunk {
        IndexedChunk {
            chunk_id: "c".into(),
            source_event_id: "s".into(),
            lineage_id: "l".into(),
            user_id: user.map(str::to_string),
            channel_id: None,
            offset: 0,
            text: "t".into(),
            embedding: vec![],
            revision_ts: 0,
            valid: true,
        }
    }

    #[test]
    fn scope_matching() {
        assert!(QueryScope::workspace().matches(&chunk(Some("U2"))));
        assert!(QueryScope::workspace().matches(&chunk(None)));
        assert!(QueryScope::user("U1", false).matches(&chunk(Some("U1"))));
        assert!(!QueryScope::user("U1", false).matches(&chunk(Some("U2"))));
        assert!(!QueryScope::user("U1", false).matches(&chunk(None)));
        assert!(QueryScope::user("U1", true).matches(&chunk(None)));
    }
}
