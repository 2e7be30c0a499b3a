//! Idempotent, order-tolerant profile aggregation.
//!
//! A [`ProfileState`] pairs the public [`UserProfile`] with a private
//! [`ProfileLedger`]. The ledger remembers which events were applied and
//! what every message currently contributes, so that:
//!
//! - re-applying an event is a no-op;
//! - an edit withdraws exactly what the previous revision contributed;
//! - a delete decrements `message_count` exactly once;
//! - reactions and memberships resolve by last-writer-wins on their
//!   logical timestamp, so arrival order does not matter;
//! - a question stays open until a message in its channel mentions the
//!   asker within the answer window, whichever arrives first.
//!
//! Nothing here re-derives state from history. Each apply touches only
//! the records the event names, and reports them as a [`ProfileDelta`]
//! so stores can persist the change without rewriting the ledger.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::{
    ActivityEntry, CanonicalEvent, Engagement, EventKind, EventPayload, OpenQuestion, UserProfile,
};
use crate::signals::{mentioned_users, MessageContent};
use crate::topics::TopicExtractor;

const DAY_MICROS: i64 = 86_400_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSettings {
    /// Live messages kept in `recent_activity`.
    pub recent_activity_limit: usize,
    /// Characters kept per activity excerpt.
    pub excerpt_chars: usize,
    /// How long after a question a mention of the asker still answers it,
    /// in microseconds.
    pub answer_window_micros: i64,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            recent_activity_limit: 20,
            excerpt_chars: 280,
            answer_window_micros: DAY_MICROS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already in the ledger.
    Duplicate,
    /// The event does not concern this user.
    NotApplicable,
}

/// What one original post currently contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub channel_id: String,
    /// Set once the post itself has been applied.
    pub posted_ts: Option<i64>,
    /// True while the message adds to counts and tallies.
    pub counted: bool,
    pub deleted: bool,
    /// Logical timestamp of the revision held in `content`.
    pub revision_ts: i64,
    pub content: Option<MessageContent>,
}

impl MessageRecord {
    fn placeholder(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            posted_ts: None,
            counted: false,
            deleted: false,
            revision_ts: i64::MIN,
            content: None,
        }
    }
}

/// Last-writer-wins mark. On equal timestamps the inactive side wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub active: bool,
    pub at: i64,
}

impl Mark {
    fn supersedes(&self, other: &Mark) -> bool {
        (self.at, !self.active) > (other.at, !other.active)
    }
}

/// A message by someone else that mentions this user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mention {
    pub channel_id: String,
    pub at: i64,
}

/// Per-user bookkeeping persisted next to the profile, never exposed in
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileLedger {
    pub applied: BTreeSet<String>,
    /// Keyed by original post id.
    pub messages: BTreeMap<String, MessageRecord>,
    /// `{channel}:{item_ts}:{name}` for reactions this user made.
    pub reactions_given: BTreeMap<String, Mark>,
    /// `{actor}:{channel}:{item_ts}:{name}` for reactions on this user's posts.
    pub reactions_received: BTreeMap<String, Mark>,
    pub membership: BTreeMap<String, Mark>,
    #[serde(default)]
    pub mentions: BTreeSet<Mention>,
}

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Message { id: String, record: MessageRecord },
    ReactionGiven { key: String, mark: Mark },
    ReactionReceived { key: String, mark: Mark },
    Membership { channel_id: String, mark: Mark },
    Mention { mention: Mention },
}

impl LedgerEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEntry::Message { .. } => "message",
            LedgerEntry::ReactionGiven { .. } => "reaction_given",
            LedgerEntry::ReactionReceived { .. } => "reaction_received",
            LedgerEntry::Membership { .. } => "membership",
            LedgerEntry::Mention { .. } => "mention",
        }
    }

    /// Unique within `kind` for one user.
    pub fn key(&self) -> String {
        match self {
            LedgerEntry::Message { id, .. } => id.clone(),
            LedgerEntry::ReactionGiven { key, .. } | LedgerEntry::ReactionReceived { key, .. } => {
                key.clone()
            }
            LedgerEntry::Membership { channel_id, .. } => channel_id.clone(),
            LedgerEntry::Mention { mention } => format!("{}:{}", mention.channel_id, mention.at),
        }
    }
}

/// The rows one applied event changed. Persisting the delta and the new
/// profile is equivalent to persisting the whole state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDelta {
    pub event_id: String,
    pub entries: Vec<LedgerEntry>,
}

impl ProfileLedger {
    /// Put one persisted row back.
    pub fn restore(&mut self, entry: LedgerEntry) {
        match entry {
            LedgerEntry::Message { id, record } => {
                self.messages.insert(id, record);
            }
            LedgerEntry::ReactionGiven { key, mark } => {
                self.reactions_given.insert(key, mark);
            }
            LedgerEntry::ReactionReceived { key, mark } => {
                self.reactions_received.insert(key, mark);
            }
            LedgerEntry::Membership { channel_id, mark } => {
                self.membership.insert(channel_id, mark);
            }
            LedgerEntry::Mention { mention } => {
                self.mentions.insert(mention);
            }
        }
    }

    pub fn record(&mut self, delta: &ProfileDelta) {
        self.applied.insert(delta.event_id.clone());
        for entry in &delta.entries {
            self.restore(entry.clone());
        }
    }

    /// Every row, for a full rewrite.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut out = Vec::new();
        out.extend(self.messages.iter().map(|(id, record)| LedgerEntry::Message {
            id: id.clone(),
            record: record.clone(),
        }));
        out.extend(self.reactions_given.iter().map(|(key, mark)| LedgerEntry::ReactionGiven {
            key: key.clone(),
            mark: *mark,
        }));
        out.extend(
            self.reactions_received
                .iter()
                .map(|(key, mark)| LedgerEntry::ReactionReceived {
                    key: key.clone(),
                    mark: *mark,
                }),
        );
        out.extend(self.membership.iter().map(|(channel_id, mark)| LedgerEntry::Membership {
            channel_id: channel_id.clone(),
            mark: *mark,
        }));
        out.extend(self.mentions.iter().map(|mention| LedgerEntry::Mention {
            mention: mention.clone(),
        }));
        out
    }
}

/// Keys touched during one apply.
#[derive(Default)]
struct Touched {
    messages: BTreeSet<String>,
    given: BTreeSet<String>,
    received: BTreeSet<String>,
    membership: BTreeSet<String>,
    mentions: Vec<Mention>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileState {
    pub profile: UserProfile,
    pub ledger: ProfileLedger,
}

impl ProfileState {
    pub fn new(user_id: &str) -> Self {
        Self {
            profile: UserProfile::new(user_id),
            ledger: ProfileLedger::default(),
        }
    }

    /// Whether `event` touches this user as actor, as reaction target, or
    /// as someone the message mentions.
    pub fn concerns(&self, event: &CanonicalEvent) -> bool {
        event.user_id == self.profile.user_id
            || self.is_reaction_target(event)
            || self.is_mention_target(event)
    }

    fn is_reaction_target(&self, event: &CanonicalEvent) -> bool {
        match &event.payload {
            EventPayload::Reaction {
                item_user: Some(owner),
                ..
            } => owner == &self.profile.user_id,
            _ => false,
        }
    }

    fn is_mention_target(&self, event: &CanonicalEvent) -> bool {
        matches!(event.kind, EventKind::Post | EventKind::Edit)
            && event.user_id != self.profile.user_id
            && event
                .text()
                .map(|t| mentioned_users(t).contains(&self.profile.user_id))
                .unwrap_or(false)
    }

    /// Apply one canonical event.
    ///
    /// Idempotent per `event_id`. Post, edit, and delete for the same
    /// message converge to the same state in any arrival order.
    pub fn apply(
        &mut self,
        event: &CanonicalEvent,
        extractor: &dyn TopicExtractor,
        settings: &ProfileSettings,
    ) -> ApplyOutcome {
        self.apply_tracked(event, extractor, settings).0
    }

    /// Like [`apply`](Self::apply), also returning the ledger rows the
    /// event changed when it was applied.
    pub fn apply_tracked(
        &mut self,
        event: &CanonicalEvent,
        extractor: &dyn TopicExtractor,
        settings: &ProfileSettings,
    ) -> (ApplyOutcome, Option<ProfileDelta>) {
        if !self.concerns(event) {
            return (ApplyOutcome::NotApplicable, None);
        }
        if !self.ledger.applied.insert(event.event_id.clone()) {
            return (ApplyOutcome::Duplicate, None);
        }

        let is_actor = event.user_id == self.profile.user_id;
        let is_target = self.is_reaction_target(event);
        let mut touched = Touched::default();

        match event.kind {
            EventKind::Post if is_actor => {
                self.apply_post(event, extractor, settings, &mut touched)
            }
            EventKind::Edit if is_actor => {
                self.apply_edit(event, extractor, settings, &mut touched)
            }
            EventKind::Delete if is_actor => self.apply_delete(event, &mut touched),
            EventKind::ReactionAdd | EventKind::ReactionRemoved => {
                self.apply_reaction(event, is_actor, is_target, &mut touched)
            }
            EventKind::Join | EventKind::Leave if is_actor => {
                self.apply_membership(event, &mut touched)
            }
            EventKind::Post | EventKind::Edit => self.apply_mention(event, settings, &mut touched),
            _ => {}
        }

        if is_actor {
            let p = &mut self.profile;
            p.last_active_logical_timestamp = Some(
                p.last_active_logical_timestamp
                    .map_or(event.logical_timestamp, |t| t.max(event.logical_timestamp)),
            );
            if let Some(seq) = event.sequence {
                let entry = p
                    .highest_applied_sequence
                    .entry(event.channel_id.clone())
                    .or_insert(seq);
                *entry = (*entry).max(seq);
            }
        }

        let delta = self.delta(&event.event_id, touched);
        (ApplyOutcome::Applied, Some(delta))
    }

    fn delta(&self, event_id: &str, touched: Touched) -> ProfileDelta {
        let ledger = &self.ledger;
        let mut entries = Vec::new();
        for id in touched.messages {
            if let Some(record) = ledger.messages.get(&id) {
                entries.push(LedgerEntry::Message {
                    record: record.clone(),
                    id,
                });
            }
        }
        for key in touched.given {
            if let Some(mark) = ledger.reactions_given.get(&key) {
                entries.push(LedgerEntry::ReactionGiven { key, mark: *mark });
            }
        }
        for key in touched.received {
            if let Some(mark) = ledger.reactions_received.get(&key) {
                entries.push(LedgerEntry::ReactionReceived { key, mark: *mark });
            }
        }
        for channel_id in touched.membership {
            if let Some(mark) = ledger.membership.get(&channel_id) {
                entries.push(LedgerEntry::Membership {
                    channel_id,
                    mark: *mark,
                });
            }
        }
        entries.extend(
            touched
                .mentions
                .into_iter()
                .map(|mention| LedgerEntry::Mention { mention }),
        );
        ProfileDelta {
            event_id: event_id.to_string(),
            entries,
        }
    }

    fn apply_post(
        &mut self,
        event: &CanonicalEvent,
        extractor: &dyn TopicExtractor,
        settings: &ProfileSettings,
        touched: &mut Touched,
    ) {
        touched.messages.insert(event.event_id.clone());
        let record = self
            .ledger
            .messages
            .entry(event.event_id.clone())
            .or_insert_with(|| MessageRecord::placeholder(&event.channel_id));
        if record.posted_ts.is_some() {
            return;
        }
        record.posted_ts = Some(event.logical_timestamp);
        if record.deleted {
            return;
        }
        // An edit that arrived first already holds a newer revision.
        if record.content.is_none() || record.revision_ts < event.logical_timestamp {
            let text = event.text().unwrap_or_default();
            record.content = Some(MessageContent::analyze(text, extractor));
            record.revision_ts = event.logical_timestamp;
        }
        record.counted = true;

        let p = &mut self.profile;
        p.message_count += 1;
        if let Some(content) = &record.content {
            adjust_tallies(p, content, true);
            upsert_activity(p, &event.event_id, record, content, settings);
        }
        self.refresh_question(&event.event_id, settings);
    }

    fn apply_edit(
        &mut self,
        event: &CanonicalEvent,
        extractor: &dyn TopicExtractor,
        settings: &ProfileSettings,
        touched: &mut Touched,
    ) {
        let Some(original) = event.supersedes.as_deref() else {
            return;
        };
        touched.messages.insert(original.to_string());
        let record = self
            .ledger
            .messages
            .entry(original.to_string())
            .or_insert_with(|| MessageRecord::placeholder(&event.channel_id));
        if record.deleted {
            return;
        }
        if record.content.is_some() && record.revision_ts >= event.logical_timestamp {
            return;
        }

        let text = event.text().unwrap_or_default();
        let next = MessageContent::analyze(text, extractor);
        let p = &mut self.profile;
        if record.counted {
            if let Some(prev) = &record.content {
                adjust_tallies(p, prev, false);
            }
            adjust_tallies(p, &next, true);
        }
        record.content = Some(next);
        record.revision_ts = event.logical_timestamp;
        if let Some(content) = &record.content {
            if record.counted {
                upsert_activity(p, original, record, content, settings);
            }
        }
        self.refresh_question(original, settings);
    }

    fn apply_delete(&mut self, event: &CanonicalEvent, touched: &mut Touched) {
        let Some(original) = event.supersedes.as_deref() else {
            return;
        };
        touched.messages.insert(original.to_string());
        let record = self
            .ledger
            .messages
            .entry(original.to_string())
            .or_insert_with(|| MessageRecord::placeholder(&event.channel_id));
        if record.deleted {
            return;
        }
        record.deleted = true;

        let p = &mut self.profile;
        if record.counted {
            if let Some(prev) = &record.content {
                adjust_tallies(p, prev, false);
            }
            p.message_count = p.message_count.saturating_sub(1);
            p.recent_activity.retain(|a| a.event_id != original);
            record.counted = false;
        }
        record.content = None;
        p.open_questions.remove(original);
    }

    fn apply_reaction(
        &mut self,
        event: &CanonicalEvent,
        is_actor: bool,
        is_target: bool,
        touched: &mut Touched,
    ) {
        let EventPayload::Reaction { name, item_ts, .. } = &event.payload else {
            return;
        };
        let mark = Mark {
            active: event.kind == EventKind::ReactionAdd,
            at: event.logical_timestamp,
        };

        if is_actor {
            let key = format!("{}:{}:{}", event.channel_id, item_ts, name);
            touched.given.insert(key.clone());
            let delta = set_mark(&mut self.ledger.reactions_given, key, mark);
            adjust(&mut self.profile.reaction_given_count, delta);
        }
        if is_target {
            let key = format!("{}:{}:{}:{}", event.user_id, event.channel_id, item_ts, name);
            touched.received.insert(key.clone());
            let delta = set_mark(&mut self.ledger.reactions_received, key, mark);
            adjust(&mut self.profile.reaction_received_count, delta);
        }
    }

    fn apply_membership(&mut self, event: &CanonicalEvent, touched: &mut Touched) {
        let mark = Mark {
            active: event.kind == EventKind::Join,
            at: event.logical_timestamp,
        };
        touched.membership.insert(event.channel_id.clone());
        set_mark(&mut self.ledger.membership, event.channel_id.clone(), mark);
        let member = self
            .ledger
            .membership
            .get(&event.channel_id)
            .map(|m| m.active)
            .unwrap_or(false);
        if member {
            self.profile
                .channel_membership
                .insert(event.channel_id.clone());
        } else {
            self.profile.channel_membership.remove(&event.channel_id);
        }
    }

    /// Someone else's message mentions this user: it answers every open
    /// question of theirs in that channel asked within the window before it.
    fn apply_mention(
        &mut self,
        event: &CanonicalEvent,
        settings: &ProfileSettings,
        touched: &mut Touched,
    ) {
        let mention = Mention {
            channel_id: event.channel_id.clone(),
            at: event.logical_timestamp,
        };
        let window = settings.answer_window_micros;
        self.profile.open_questions.retain(|_, q| {
            !(q.channel_id == mention.channel_id
                && q.asked_ts < mention.at
                && mention.at <= q.asked_ts.saturating_add(window))
        });
        if self.ledger.mentions.insert(mention.clone()) {
            touched.mentions.push(mention);
        }
    }

    /// Recompute whether the message is an open question.
    fn refresh_question(&mut self, message_id: &str, settings: &ProfileSettings) {
        let open = match self.ledger.messages.get(message_id) {
            Some(record) if record.counted => match (&record.content, record.posted_ts) {
                (Some(content), Some(asked_ts))
                    if content.signals.is_question
                        && !self.is_answered(&record.channel_id, asked_ts, settings) =>
                {
                    Some(OpenQuestion {
                        channel_id: record.channel_id.clone(),
                        asked_ts,
                        excerpt: content.text.chars().take(settings.excerpt_chars).collect(),
                    })
                }
                _ => None,
            },
            _ => None,
        };
        match open {
            Some(q) => {
                self.profile.open_questions.insert(message_id.to_string(), q);
            }
            None => {
                self.profile.open_questions.remove(message_id);
            }
        }
    }

    fn is_answered(&self, channel_id: &str, asked_ts: i64, settings: &ProfileSettings) -> bool {
        let from = Mention {
            channel_id: channel_id.to_string(),
            at: asked_ts.saturating_add(1),
        };
        let to = Mention {
            channel_id: channel_id.to_string(),
            at: asked_ts.saturating_add(settings.answer_window_micros),
        };
        from <= to && self.ledger.mentions.range(from..=to).next().is_some()
    }

    /// Original post ids in `channel_id` whose post has been applied.
    ///
    /// Used to seed an ordering gate after a restart so edits of old posts
    /// are not parked as orphans.
    pub fn applied_posts_in(&self, channel_id: &str) -> Vec<String> {
        self.ledger
            .messages
            .iter()
            .filter(|(_, r)| r.channel_id == channel_id && r.posted_ts.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Current text of a live message, if it is counted.
    pub fn live_text(&self, message_id: &str) -> Option<&str> {
        self.ledger
            .messages
            .get(message_id)
            .filter(|r| r.counted)
            .and_then(|r| r.content.as_ref())
            .map(|c| c.text.as_str())
    }
}

/// Store `mark` if it wins, returning the change in active count.
fn set_mark(marks: &mut BTreeMap<String, Mark>, key: String, mark: Mark) -> i64 {
    let before = match marks.get(&key) {
        Some(existing) if !mark.supersedes(existing) => return 0,
        Some(existing) => existing.active,
        None => false,
    };
    marks.insert(key, mark);
    (mark.active as i64) - (before as i64)
}

fn adjust(value: &mut u64, delta: i64) {
    if delta >= 0 {
        *value += delta as u64;
    } else {
        *value = value.saturating_sub(delta.unsigned_abs());
    }
}

fn adjust_tallies(p: &mut UserProfile, content: &MessageContent, add: bool) {
    let step: i64 = if add { 1 } else { -1 };
    for topic in &content.topics {
        let count = p.topic_frequency.entry(topic.clone()).or_insert(0);
        adjust(count, step);
        if *count == 0 {
            p.topic_frequency.remove(topic);
        }
    }

    let s = &content.signals;
    adjust(&mut p.sentiment.total, step * s.sentiment as i64);
    adjust(&mut p.sentiment.samples, step);
    let bucket = match s.engagement {
        Engagement::Low => &mut p.engagement.low,
        Engagement::Medium => &mut p.engagement.medium,
        Engagement::High => &mut p.engagement.high,
    };
    adjust(bucket, step);
    if s.is_question {
        adjust(&mut p.question_count, step);
    }
    adjust(&mut p.total_chars, step * s.chars as i64);
    adjust(&mut p.advocate_hits, step * s.advocate_hits as i64);
    adjust(&mut p.learner_hits, step * s.learner_hits as i64);
}

fn upsert_activity(
    p: &mut UserProfile,
    message_id: &str,
    record: &MessageRecord,
    content: &MessageContent,
    settings: &ProfileSettings,
) {
    p.recent_activity.retain(|a| a.event_id != message_id);
    if settings.recent_activity_limit == 0 {
        return;
    }
    p.recent_activity.push(ActivityEntry {
        event_id: message_id.to_string(),
        channel_id: record.channel_id.clone(),
        logical_timestamp: record.posted_ts.unwrap_or(record.revision_ts),
        excerpt: content.text.chars().take(settings.excerpt_chars).collect(),
        is_question: content.signals.is_question,
    });
    p.recent_activity.sort_by(|a, b| {
        b.logical_timestamp
            .cmp(&a.logical_timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    p.recent_activity.truncate(settings.recent_activity_limit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message_event_id;
    use crate::topics::KeywordTopicExtractor;

    fn post(user: &str, ts: i64, text: &str) -> CanonicalEvent {
        CanonicalEvent {
            event_id: message_event_id("C1", &ts.to_string()),
            channel_id: "C1".into(),
            user_id: user.into(),
            kind: EventKind::Post,
            logical_timestamp: ts,
            sequence: None,
            payload: EventPayload::Text { text: text.into() },
            supersedes: None,
        }
    }

    fn edit(original: &CanonicalEvent, ts: i64, text: &str) -> CanonicalEvent {
        CanonicalEvent {
            event_id: format!("edit:{}:{}", original.event_id, ts),
            kind: EventKind::Edit,
            logical_timestamp: ts,
            payload: EventPayload::Text { text: text.into() },
            supersedes: Some(original.event_id.clone()),
            ..original.clone()
        }
    }

    fn delete(original: &CanonicalEvent, ts: i64) -> CanonicalEvent {
        CanonicalEvent {
            event_id: format!("del:{}", original.event_id),
            kind: EventKind::Delete,
            logical_timestamp: ts,
            payload: EventPayload::Empty,
            supersedes: Some(original.event_id.clone()),
            ..original.clone()
        }
    }

    fn reaction(actor: &str, owner: &str, item_ts: i64, add: bool, ts: i64) -> CanonicalEvent {
        CanonicalEvent {
            event_id: format!("rxn:{}:{}:{}:{}", actor, item_ts, add, ts),
            channel_id: "C1".into(),
            user_id: actor.into(),
            kind: if add {
                EventKind::ReactionAdd
            } else {
                EventKind::ReactionRemoved
            },
            logical_timestamp: ts,
            sequence: None,
            payload: EventPayload::Reaction {
                name: "tada".into(),
                item_ts: item_ts.to_string(),
                item_user: Some(owner.into()),
            },
            supersedes: None,
        }
    }

    fn run(user: &str, events: &[&CanonicalEvent]) -> ProfileState {
        let ex = KeywordTopicExtractor::default();
        let settings = ProfileSettings::default();
        let mut state = ProfileState::new(user);
        for e in events {
            state.apply(e, &ex, &settings);
        }
        state
    }

    #[test]
    fn apply_twice_is_apply_once() {
        let p = post("U1", 100, "We shipped the billing fix");
        let once = run("U1", &[&p]);
        let twice = run("U1", &[&p, &p]);
        assert_eq!(once, twice);

        let ex = KeywordTopicExtractor::default();
        let mut state = once.clone();
        assert_eq!(
            state.apply(&p, &ex, &ProfileSettings::default()),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn billing_edit_counts_once_in_either_order() {
        let e1 = post("U1", 100, "We shipped the billing fix");
        let e2 = edit(&e1, 200, "We shipped the billing fix today");

        let forward = run("U1", &[&e1, &e2]);
        let reverse = run("U1", &[&e2, &e1]);
        assert_eq!(forward.profile, reverse.profile);
        assert_eq!(forward.profile.message_count, 1);
        assert_eq!(forward.profile.topic_frequency.get("billing"), Some(&1));
        assert_eq!(
            forward.live_text(&e1.event_id),
            Some("We shipped the billing fix today")
        );
        assert_eq!(
            forward.profile.recent_activity[0].excerpt,
            "We shipped the billing fix today"
        );
    }

    #[test]
    fn edit_recomputes_topics_without_touching_count() {
        let e1 = post("U1", 100, "deploy pipeline broken");
        let e2 = edit(&e1, 200, "billing pipeline fixed");
        let state = run("U1", &[&e1, &e2]);
        let topics = &state.profile.topic_frequency;
        assert_eq!(state.profile.message_count, 1);
        assert!(!topics.contains_key("deploy"));
        assert_eq!(topics.get("pipeline"), Some(&1));
        assert_eq!(topics.get("billing"), Some(&1));
        assert_eq!(state.profile.sentiment.samples, 1);
    }

    #[test]
    fn stale_edit_is_ignored() {
        let e1 = post("U1", 100, "first draft");
        let newer = edit(&e1, 300, "final wording");
        let older = edit(&e1, 200, "second draft");
        let state = run("U1", &[&e1, &newer, &older]);
        assert_eq!(state.live_text(&e1.event_id), Some("final wording"));
        let other = run("U1", &[&older, &e1, &newer]);
        assert_eq!(state.profile, other.profile);
    }

    #[test]
    fn delete_nets_zero_in_any_order() {
        let e1 = post("U1", 100, "We shipped the billing fix");
        let d = delete(&e1, 150);
        let empty = ProfileState::new("U1").profile;

        for order in [vec![&e1, &d], vec![&d, &e1]] {
            let state = run("U1", &order);
            assert_eq!(state.profile.message_count, 0);
            assert!(state.profile.topic_frequency.is_empty());
            assert!(state.profile.recent_activity.is_empty());
            assert_eq!(state.profile.sentiment, empty.sentiment);
        }

        let twice = run("U1", &[&e1, &d, &d]);
        assert_eq!(twice.profile.message_count, 0);
    }

    #[test]
    fn edit_after_delete_does_not_resurrect() {
        let e1 = post("U1", 100, "secret plan");
        let d = delete(&e1, 150);
        let e2 = edit(&e1, 200, "secret plan revised");
        let state = run("U1", &[&e1, &d, &e2]);
        assert_eq!(state.profile.message_count, 0);
        assert!(state.profile.topic_frequency.is_empty());
        assert_eq!(state.live_text(&e1.event_id), None);
    }

    #[test]
    fn reactions_count_for_actor_and_owner() {
        let add = reaction("U2", "U1", 100, true, 500);
        let remove = reaction("U2", "U1", 100, false, 600);

        let actor = run("U2", &[&add]);
        assert_eq!(actor.profile.reaction_given_count, 1);
        let owner = run("U1", &[&add]);
        assert_eq!(owner.profile.reaction_received_count, 1);
        assert_eq!(owner.profile.last_active_logical_timestamp, None);

        for order in [vec![&add, &remove], vec![&remove, &add]] {
            assert_eq!(run("U2", &order).profile.reaction_given_count, 0);
            assert_eq!(run("U1", &order).profile.reaction_received_count, 0);
        }
    }

    #[test]
    fn unrelated_event_is_not_applicable() {
        let ex = KeywordTopicExtractor::default();
        let mut state = ProfileState::new("U9");
        let p = post("U1", 100, "hello world");
        assert_eq!(
            state.apply(&p, &ex, &ProfileSettings::default()),
            ApplyOutcome::NotApplicable
        );
        assert!(state.ledger.applied.is_empty());
    }

    #[test]
    fn membership_is_last_writer_wins() {
        let join = CanonicalEvent {
            event_id: "join:C1:U1:100".into(),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            kind: EventKind::Join,
            logical_timestamp: 100,
            sequence: Some(1),
            payload: EventPayload::Membership,
            supersedes: None,
        };
        let leave = CanonicalEvent {
            event_id: "leave:C1:U1:200".into(),
            kind: EventKind::Leave,
            logical_timestamp: 200,
            sequence: Some(2),
            ..join.clone()
        };
        for order in [vec![&join, &leave], vec![&leave, &join]] {
            let state = run("U1", &order);
            assert!(state.profile.channel_membership.is_empty());
            assert_eq!(state.profile.highest_applied_sequence.get("C1"), Some(&2));
            assert_eq!(state.profile.last_active_logical_timestamp, Some(200));
        }
        let joined = run("U1", &[&join]);
        assert!(joined.profile.channel_membership.contains("C1"));
    }

    #[test]
    fn recent_activity_is_bounded_and_newest_first() {
        let ex = KeywordTopicExtractor::default();
        let settings = ProfileSettings {
            recent_activity_limit: 2,
            excerpt_chars: 5,
            ..ProfileSettings::default()
        };
        let mut state = ProfileState::new("U1");
        for ts in [100, 300, 200] {
            state.apply(&post("U1", ts, "message body"), &ex, &settings);
        }
        let ts: Vec<i64> = state
            .profile
            .recent_activity
            .iter()
            .map(|a| a.logical_timestamp)
            .collect();
        assert_eq!(ts, vec![300, 200]);
        assert_eq!(state.profile.recent_activity[0].excerpt, "messa");
        assert_eq!(state.profile.message_count, 3);
    }

    #[test]
    fn applied_posts_seed() {
        let e1 = post("U1", 100, "hello");
        let state = run("U1", &[&e1]);
        assert_eq!(state.applied_posts_in("C1"), vec![e1.event_id.clone()]);
        assert!(state.applied_posts_in("C2").is_empty());
    }

    fn in_channel(mut event: CanonicalEvent, user: &str, ts: i64) -> CanonicalEvent {
        event.user_id = user.into();
        event.event_id = message_event_id(&event.channel_id, &ts.to_string());
        event.logical_timestamp = ts;
        event
    }

    const HOUR: i64 = 3_600_000_000;

    #[test]
    fn question_is_answered_by_a_later_mention_in_either_order() {
        let q = post("U1", 100, "Is the billing export broken?");
        let reply = in_channel(post("U2", 0, "<@U1> yes, fixed now"), "U2", 100 + HOUR);

        for order in [vec![&q, &reply], vec![&reply, &q]] {
            let state = run("U1", &order);
            assert!(state.profile.open_questions.is_empty());
            assert_eq!(state.profile.message_count, 1);
        }

        let asker = run("U1", &[&q]);
        let open = &asker.profile.open_questions[&q.event_id];
        assert_eq!(open.channel_id, "C1");
        assert_eq!(open.asked_ts, 100);
    }

    #[test]
    fn mention_outside_the_window_leaves_question_open() {
        let q = post("U1", 100, "Anyone own the deploy runbook?");
        let before = in_channel(post("U2", 0, "<@U1> hi"), "U2", 50);
        let late = in_channel(post("U2", 0, "<@U1> me"), "U2", 100 + 25 * HOUR);
        let elsewhere = CanonicalEvent {
            channel_id: "C2".into(),
            ..in_channel(post("U2", 0, "<@U1> me"), "U2", 100 + HOUR)
        };
        let state = run("U1", &[&before, &q, &late, &elsewhere]);
        assert!(state.profile.open_questions.contains_key(&q.event_id));
        assert_eq!(state.ledger.mentions.len(), 3);
        // Being mentioned is not activity.
        assert_eq!(state.profile.last_active_logical_timestamp, Some(100));
    }

    #[test]
    fn edits_and_deletes_update_open_questions() {
        let q = post("U1", 100, "Where do refunds go?");
        let statement = edit(&q, 200, "Refunds go to finance.");
        let state = run("U1", &[&q, &statement]);
        assert!(state.profile.open_questions.is_empty());

        let gone = run("U1", &[&q, &delete(&q, 150)]);
        assert!(gone.profile.open_questions.is_empty());
    }

    #[test]
    fn delta_replays_to_the_same_ledger() {
        let ex = KeywordTopicExtractor::default();
        let settings = ProfileSettings::default();
        let e1 = post("U1", 100, "billing question?");
        let events = [
            e1.clone(),
            edit(&e1, 200, "billing answer"),
            reaction("U1", "U2", 100, true, 300),
            reaction("U3", "U1", 100, true, 400),
            in_channel(post("U2", 0, "thanks <@U1>"), "U2", 500),
        ];

        let mut state = ProfileState::new("U1");
        let mut rebuilt = ProfileLedger::default();
        for event in &events {
            let (outcome, delta) = state.apply_tracked(event, &ex, &settings);
            assert_eq!(outcome, ApplyOutcome::Applied);
            let delta = delta.expect("applied events carry a delta");
            assert_eq!(delta.event_id, event.event_id);
            assert!(!delta.entries.is_empty());
            rebuilt.record(&delta);
        }
        assert_eq!(rebuilt, state.ledger);

        let (outcome, delta) = state.apply_tracked(&events[0], &ex, &settings);
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert!(delta.is_none());
    }

    #[test]
    fn ledger_entries_round_trip() {
        let e1 = post("U1", 100, "hello");
        let state = run("U1", &[&e1, &reaction("U1", "U2", 100, true, 300)]);
        let mut restored = ProfileLedger {
            applied: state.ledger.applied.clone(),
            ..ProfileLedger::default()
        };
        for entry in state.ledger.entries() {
            restored.restore(entry);
        }
        assert_eq!(restored, state.ledger);
    }
}
