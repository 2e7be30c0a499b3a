//! Core data models shared by every pipeline stage.
//!
//! # Data Flow
//!
//! ```text
//! raw Slack JSON ──normalize──▶ CanonicalEvent ──gate──▶ released events
//!                                                           │
//!                                  ┌────────────────────────┤
//!                                  ▼                        ▼
//!                            UserProfile              IndexedChunk
//!                                  │                        │
//!                                  └──────▶ ContextBundle ◀─┘
//! ```
//!
//! Canonical events are immutable once normalized. Profiles and chunks are
//! derived projections that can be rebuilt from the event log.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DegradedContext;

/// Kind of a canonical workspace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Post,
    Edit,
    Delete,
    ReactionAdd,
    ReactionRemoved,
    Join,
    Leave,
    /// Anything the normalizer does not recognize. Kept so the stream
    /// stays continuous.
    Unknown,
}

impl EventKind {
    /// Edits and deletes replace the effect of an earlier post.
    pub fn is_supersession(&self) -> bool {
        matches!(self, EventKind::Edit | EventKind::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Post => "post",
            EventKind::Edit => "edit",
            EventKind::Delete => "delete",
            EventKind::ReactionAdd => "reaction_add",
            EventKind::ReactionRemoved => "reaction_removed",
            EventKind::Join => "join",
            EventKind::Leave => "leave",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Kind-specific event content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Message body for posts and edits.
    Text { text: String },
    /// A reaction on the message posted at `item_ts` by `item_user`.
    Reaction {
        name: String,
        item_ts: String,
        item_user: Option<String>,
    },
    Membership,
    /// Deletes carry no content of their own.
    Empty,
    Other { raw_type: String },
}

/// A normalized, immutable workspace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Stable provider-assigned id. Posts use `msg:{channel}:{ts}`.
    pub event_id: String,
    pub channel_id: String,
    /// The acting user (author, reactor, joiner).
    pub user_id: String,
    pub kind: EventKind,
    /// Microseconds since the Unix epoch, taken from the provider's ts.
    pub logical_timestamp: i64,
    /// Transport sequence for the (channel, user) pair, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub payload: EventPayload,
    /// The post this edit or delete replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

impl CanonicalEvent {
    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey::new(&self.channel_id, &self.user_id)
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text { text } => Some(text),
            _ => None,
        }
    }

    /// The id of the original post this event belongs to, if any.
    ///
    /// Posts are their own lineage; edits and deletes point at the post
    /// they supersede.
    pub fn lineage_id(&self) -> Option<&str> {
        match self.kind {
            EventKind::Post => Some(&self.event_id),
            EventKind::Edit | EventKind::Delete => self.supersedes.as_deref(),
            _ => None,
        }
    }
}

/// Channel or user id of an event the provider did not attribute.
pub const UNATTRIBUTED: &str = "-";

/// Event id for the message posted at `ts` in `channel`.
pub fn message_event_id(channel_id: &str, ts: &str) -> String {
    format!("msg:{}:{}", channel_id, ts)
}

/// Serialization key for the ordering gate and per-key workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderingKey {
    pub channel_id: String,
    pub user_id: String,
}

impl OrderingKey {
    pub fn new(channel_id: &str, user_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.user_id)
    }
}

/// Engagement bucket of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    /// Short replies and emoji.
    Low,
    Medium,
    /// Questions and long-form messages.
    High,
}

/// Running sum of 1–5 sentiment scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentTally {
    pub total: u64,
    pub samples: u64,
}

impl SentimentTally {
    pub fn average(&self) -> Option<f64> {
        if self.samples == 0 {
            None
        } else {
            Some(self.total as f64 / self.samples as f64)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementTally {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl EngagementTally {
    pub fn total(&self) -> u64 {
        self.low + self.medium + self.high
    }
}

/// One of the user's latest live messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub event_id: String,
    pub channel_id: String,
    pub logical_timestamp: i64,
    pub excerpt: String,
    pub is_question: bool,
}

/// A question the user asked that nobody has answered yet.
///
/// A later message in the same channel that mentions the asker within the
/// answer window resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenQuestion {
    pub channel_id: String,
    pub asked_ts: i64,
    pub excerpt: String,
}

/// Durable aggregate summary of one user's observed activity.
///
/// Owned by the profile aggregator and only changed through
/// [`ProfileState::apply`](crate::profile::ProfileState::apply).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub channel_membership: BTreeSet<String>,
    pub message_count: u64,
    pub reaction_given_count: u64,
    pub reaction_received_count: u64,
    pub topic_frequency: BTreeMap<String, u64>,
    pub last_active_logical_timestamp: Option<i64>,
    /// Highest transport sequence applied, per channel.
    pub highest_applied_sequence: BTreeMap<String, u64>,
    pub sentiment: SentimentTally,
    pub engagement: EngagementTally,
    pub question_count: u64,
    pub total_chars: u64,
    pub advocate_hits: u64,
    pub learner_hits: u64,
    /// Newest first.
    pub recent_activity: Vec<ActivityEntry>,
    /// Unanswered questions keyed by message id.
    #[serde(default)]
    pub open_questions: BTreeMap<String, OpenQuestion>,
}

impl UserProfile {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    /// Topics ordered by count, ties broken alphabetically.
    pub fn top_topics(&self, n: usize) -> Vec<(String, u64)> {
        let mut topics: Vec<(String, u64)> = self
            .topic_frequency
            .iter()
            .map(|(t, c)| (t.clone(), *c))
            .collect();
        topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        topics.truncate(n);
        topics
    }

    pub fn question_ratio(&self) -> f64 {
        if self.message_count == 0 {
            0.0
        } else {
            self.question_count as f64 / self.message_count as f64
        }
    }

    /// Open questions, oldest first.
    pub fn open_questions_by_age(&self) -> Vec<(&str, &OpenQuestion)> {
        let mut open: Vec<(&str, &OpenQuestion)> = self
            .open_questions
            .iter()
            .map(|(id, q)| (id.as_str(), q))
            .collect();
        open.sort_by(|a, b| a.1.asked_ts.cmp(&b.1.asked_ts).then_with(|| a.0.cmp(b.0)));
        open
    }

    pub fn average_length(&self) -> f64 {
        if self.message_count == 0 {
            0.0
        } else {
            self.total_chars as f64 / self.message_count as f64
        }
    }
}

/// A unit of indexed text derived from one event or document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    /// SHA-256 of `"{source_event_id}:{offset}"`.
    pub chunk_id: String,
    pub source_event_id: String,
    /// Original post id, or `doc:{path}` for external documents.
    pub lineage_id: String,
    /// `None` for non-user documents.
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub offset: usize,
    pub text: String,
    pub embedding: Vec<f32>,
    pub revision_ts: i64,
    pub valid: bool,
}

/// A retrieved chunk as seen by the ranker.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: IndexedChunk,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub text: String,
    pub relevance_score: f64,
    pub source_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The budget-bounded package handed to the generation provider.
///
/// Built fresh per request and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub request_id: String,
    pub target_user_id: String,
    pub intent: String,
    pub budget: usize,
    /// An owned copy taken at request time.
    pub profile_snapshot: Option<UserProfile>,
    pub profile_facts: Vec<String>,
    pub ranked_items: Vec<RankedItem>,
    pub total_token_estimate: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<DegradedContext>,
}

impl ContextBundle {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_of_post_and_edit() {
        let post = CanonicalEvent {
            event_id: message_event_id("C1", "1.000100"),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            kind: EventKind::Post,
            logical_timestamp: 1_000_100,
            sequence: None,
            payload: EventPayload::Text { text: "hi".into() },
            supersedes: None,
        };
        assert_eq!(post.lineage_id(), Some("msg:C1:1.000100"));

        let edit = CanonicalEvent {
            event_id: "Ev1".into(),
            kind: EventKind::Edit,
            supersedes: Some(post.event_id.clone()),
            ..post.clone()
        };
        assert_eq!(edit.lineage_id(), Some("msg:C1:1.000100"));
        assert_eq!(edit.ordering_key().to_string(), "C1/U1");
    }

    #[test]
    fn top_topics_orders_by_count_then_name() {
        let mut p = UserProfile::new("U1");
        p.topic_frequency.insert("billing".into(), 3);
        p.topic_frequency.insert("deploy".into(), 3);
        p.topic_frequency.insert("api".into(), 1);
        let top = p.top_topics(2);
        assert_eq!(top[0].0, "billing");
        assert_eq!(top[1].0, "deploy");
    }
}
