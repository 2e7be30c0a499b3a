//! Supersession decisions for indexed chunks.
//!
//! Every chunk belongs to a lineage: the original post id for messages, or
//! `doc:{path}` for documents. A lineage has one head revision. Index
//! backends call [`decide`] under their own write lock and then carry out
//! the decision: invalidate every chunk of the lineage, insert the new
//! revision's chunks, or do nothing.
//!
//! Revisions are ordered by `(revision_ts, source_event_id)`, so an edit
//! that is indexed before its original post wins over the post, and a
//! delete wins over everything. Stale text is never resurrected.

use serde::{Deserialize, Serialize};

use crate::chunk::TextChunk;
use crate::models::IndexedChunk;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageHead {
    pub source_event_id: String,
    pub revision_ts: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RevisionKind {
    Replace(Vec<IndexedChunk>),
    Tombstone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub lineage_id: String,
    pub source_event_id: String,
    pub revision_ts: i64,
    pub kind: RevisionKind,
}

impl Revision {
    /// A revision that replaces the lineage's text with `chunks`.
    ///
    /// `vectors` must be parallel to `chunks`.
    pub fn replace(
        lineage_id: &str,
        source_event_id: &str,
        revision_ts: i64,
        user_id: Option<&str>,
        channel_id: Option<&str>,
        chunks: Vec<TextChunk>,
        vectors: Vec<Vec<f32>>,
    ) -> Self {
        let indexed = chunks
            .into_iter()
            .zip(vectors)
            .map(|(c, embedding)| IndexedChunk {
                chunk_id: c.chunk_id,
                source_event_id: source_event_id.to_string(),
                lineage_id: lineage_id.to_string(),
                user_id: user_id.map(str::to_string),
                channel_id: channel_id.map(str::to_string),
                offset: c.offset,
                text: c.text,
                embedding,
                revision_ts,
                valid: true,
            })
            .collect();
        Self {
            lineage_id: lineage_id.to_string(),
            source_event_id: source_event_id.to_string(),
            revision_ts,
            kind: RevisionKind::Replace(indexed),
        }
    }

    pub fn tombstone(lineage_id: &str, source_event_id: &str, revision_ts: i64) -> Self {
        Self {
            lineage_id: lineage_id.to_string(),
            source_event_id: source_event_id.to_string(),
            revision_ts,
            kind: RevisionKind::Tombstone,
        }
    }

    /// The head recorded once this revision is applied.
    pub fn head(&self) -> LineageHead {
        LineageHead {
            source_event_id: self.source_event_id.clone(),
            revision_ts: self.revision_ts,
            deleted: matches!(self.kind, RevisionKind::Tombstone),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Invalidate the lineage, then insert the revision's chunks.
    Replace,
    /// Invalidate the lineage and close it.
    Tombstone,
    /// Older than the head, or the lineage is closed.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOutcome {
    Applied { invalidated: usize, inserted: usize },
    Deleted { invalidated: usize },
    Stale,
}

pub fn decide(head: Option<&LineageHead>, revision: &Revision) -> Decision {
    match head {
        Some(h) if h.deleted => Decision::Stale,
        _ if matches!(revision.kind, RevisionKind::Tombstone) => Decision::Tombstone,
        Some(h)
            if (revision.revision_ts, revision.source_event_id.as_str())
                <= (h.revision_ts, h.source_event_id.as_str()) =>
        {
            Decision::Stale
        }
        _ => Decision::Replace,
    }
}
