//! Slack event normalizer.
//!
//! Converts one raw Slack Events API payload into a [`CanonicalEvent`].
//! Accepts either an `event_callback` envelope or the bare inner event.
//!
//! Normalization is pure: no clock reads, no random ids. Every event id is
//! derived from provider fields, so a redelivered payload always maps to
//! the same id no matter which envelope it came in.
//!
//! # Mapping
//!
//! | Slack event | Kind | event_id |
//! |-------------|------|----------|
//! | `message` (plain, `thread_broadcast`, `file_share`, `bot_message`, `me_message`) | `Post` | `msg:{channel}:{ts}` |
//! | `message` / `message_changed` | `Edit` | `edit:{channel}:{orig_ts}:{edit_ts}` |
//! | `message` / `message_deleted` | `Delete` | `del:{channel}:{orig_ts}` |
//! | `reaction_added` / `reaction_removed` | `ReactionAdd` / `ReactionRemoved` | `rxn:{channel}:{item_ts}:{user}:{name}:{+/-}:{ts}` |
//! | `member_joined_channel`, `message` / `channel_join` | `Join` | `join:{channel}:{user}:{ts}` |
//! | `member_left_channel`, `message` / `channel_leave` | `Leave` | `leave:{channel}:{user}:{ts}` |
//! | anything else | `Unknown` | envelope id or `evt:{type}:{channel}:{ts}` |

use serde::Deserialize;
use serde_json::Value;

use crate::error::PipelineError;
use crate::models::{message_event_id, CanonicalEvent, EventKind, EventPayload, UNATTRIBUTED};

/// Message subtypes that count as a new post.
const POST_SUBTYPES: &[&str] = &["thread_broadcast", "file_share", "bot_message", "me_message"];

/// Message subtypes with a dedicated mapping besides posts.
const MESSAGE_SUBTYPES: &[&str] = &[
    "message_changed",
    "message_deleted",
    "channel_join",
    "channel_leave",
];

/// Typed view of the kinds the normalizer maps. Unknown kinds never go
/// through this struct; their fields may have any shape.
#[derive(Debug, Default, Deserialize)]
struct SlackEvent {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<Value>,
    #[serde(default)]
    event_ts: Option<Value>,
    #[serde(default)]
    deleted_ts: Option<String>,
    #[serde(default)]
    message: Option<SlackMessage>,
    #[serde(default)]
    previous_message: Option<SlackMessage>,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    item_user: Option<String>,
    #[serde(default)]
    item: Option<SlackItem>,
}

impl SlackEvent {
    fn timestamp(&self) -> Result<(String, i64), PipelineError> {
        timestamp(self.ts.as_ref(), self.event_ts.as_ref())
    }
}

#[derive(Debug, Default, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    edited: Option<SlackEdited>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackEdited {
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackItem {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// Normalize one raw provider event.
///
/// # Errors
///
/// Returns [`PipelineError::MalformedEvent`] when the event type, channel,
/// user, or timestamp is missing, or when a kind-specific field (the
/// edited message, `deleted_ts`, the reaction item) is absent. Unknown
/// event types are not errors; they map to [`EventKind::Unknown`] whatever
/// the shape of their other fields.
pub fn normalize(raw: &Value) -> Result<CanonicalEvent, PipelineError> {
    if !raw.is_object() {
        return Err(PipelineError::malformed("not an event object"));
    }

    let (inner, envelope_id, envelope_seq) = if str_field(raw, "type") == Some("event_callback") {
        let inner = raw
            .get("event")
            .filter(|e| e.is_object())
            .ok_or_else(|| PipelineError::malformed("event_callback without event"))?;
        (
            inner,
            str_field(raw, "event_id").map(str::to_string),
            raw.get("seq").and_then(Value::as_u64),
        )
    } else {
        (raw, None, None)
    };

    let event_type = str_field(inner, "type")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PipelineError::malformed("missing event type"))?;
    let subtype = str_field(inner, "subtype");
    let sequence = inner.get("seq").and_then(Value::as_u64).or(envelope_seq);

    match (event_type, subtype) {
        ("message", None) => normalize_message(typed(inner)?, sequence),
        ("message", Some(sub)) if POST_SUBTYPES.contains(&sub) || MESSAGE_SUBTYPES.contains(&sub) => {
            normalize_message(typed(inner)?, sequence)
        }
        ("message", Some(other)) => {
            normalize_unknown(inner, format!("message:{}", other), sequence, envelope_id)
        }
        ("reaction_added", _) => normalize_reaction(typed(inner)?, EventKind::ReactionAdd, sequence),
        ("reaction_removed", _) => {
            normalize_reaction(typed(inner)?, EventKind::ReactionRemoved, sequence)
        }
        ("member_joined_channel", _) => {
            normalize_membership(typed(inner)?, EventKind::Join, sequence)
        }
        ("member_left_channel", _) => {
            normalize_membership(typed(inner)?, EventKind::Leave, sequence)
        }
        (other, _) => normalize_unknown(inner, other.to_string(), sequence, envelope_id),
    }
}

fn typed(inner: &Value) -> Result<SlackEvent, PipelineError> {
    SlackEvent::deserialize(inner)
        .map_err(|e| PipelineError::malformed(format!("invalid event body: {}", e)))
}

fn normalize_message(
    event: SlackEvent,
    sequence: Option<u64>,
) -> Result<CanonicalEvent, PipelineError> {
    match event.subtype.as_deref() {
        Some("message_changed") => {
            let channel = require(event.channel.as_deref(), "channel")?;
            let message = event
                .message
                .as_ref()
                .ok_or_else(|| PipelineError::malformed("message_changed without message"))?;
            let user = require(message.user.as_deref(), "message.user")?;
            let orig_ts = require(message.ts.as_deref(), "message.ts")?;
            // The edit's own time is the edited.ts marker, falling back to
            // the event ts.
            let edit_ts = match message.edited.as_ref().and_then(|e| e.ts.clone()) {
                Some(ts) => ts,
                None => event.timestamp()?.0,
            };
            let micros = parse_slack_ts(&edit_ts)
                .ok_or_else(|| PipelineError::malformed(format!("invalid ts '{}'", edit_ts)))?;
            Ok(CanonicalEvent {
                event_id: format!("edit:{}:{}:{}", channel, orig_ts, edit_ts),
                channel_id: channel.to_string(),
                user_id: user.to_string(),
                kind: EventKind::Edit,
                logical_timestamp: micros,
                sequence,
                payload: EventPayload::Text {
                    text: message.text.clone().unwrap_or_default(),
                },
                supersedes: Some(message_event_id(channel, orig_ts)),
            })
        }
        Some("message_deleted") => {
            let channel = require(event.channel.as_deref(), "channel")?;
            let deleted_ts = require(event.deleted_ts.as_deref(), "deleted_ts")?;
            let user = event
                .previous_message
                .as_ref()
                .and_then(|m| m.user.as_deref())
                .or(event.user.as_deref())
                .filter(|u| !u.is_empty())
                .ok_or_else(|| PipelineError::malformed("message_deleted without author"))?;
            let (_, micros) = event.timestamp()?;
            Ok(CanonicalEvent {
                event_id: format!("del:{}:{}", channel, deleted_ts),
                channel_id: channel.to_string(),
                user_id: user.to_string(),
                kind: EventKind::Delete,
                logical_timestamp: micros,
                sequence,
                payload: EventPayload::Empty,
                supersedes: Some(message_event_id(channel, deleted_ts)),
            })
        }
        Some("channel_join") => normalize_membership(event, EventKind::Join, sequence),
        Some("channel_leave") => normalize_membership(event, EventKind::Leave, sequence),
        _ => {
            let channel = require(event.channel.as_deref(), "channel")?;
            let user = event
                .user
                .as_deref()
                .or(event.bot_id.as_deref())
                .filter(|u| !u.is_empty())
                .ok_or_else(|| PipelineError::malformed("message without user"))?;
            let (ts, micros) = event.timestamp()?;
            Ok(CanonicalEvent {
                event_id: message_event_id(channel, &ts),
                channel_id: channel.to_string(),
                user_id: user.to_string(),
                kind: EventKind::Post,
                logical_timestamp: micros,
                sequence,
                payload: EventPayload::Text {
                    text: event.text.clone().unwrap_or_default(),
                },
                supersedes: None,
            })
        }
    }
}

fn normalize_reaction(
    event: SlackEvent,
    kind: EventKind,
    sequence: Option<u64>,
) -> Result<CanonicalEvent, PipelineError> {
    let user = require(event.user.as_deref(), "user")?;
    let name = require(event.reaction.as_deref(), "reaction")?;
    let item = event
        .item
        .as_ref()
        .ok_or_else(|| PipelineError::malformed("reaction without item"))?;
    let channel = require(item.channel.as_deref(), "item.channel")?;
    let item_ts = require(item.ts.as_deref(), "item.ts")?;
    let (ts, micros) = event.timestamp()?;
    let sign = if kind == EventKind::ReactionAdd { "+" } else { "-" };

    Ok(CanonicalEvent {
        event_id: format!("rxn:{}:{}:{}:{}:{}:{}", channel, item_ts, user, name, sign, ts),
        channel_id: channel.to_string(),
        user_id: user.to_string(),
        kind,
        logical_timestamp: micros,
        sequence,
        payload: EventPayload::Reaction {
            name: name.to_string(),
            item_ts: item_ts.to_string(),
            item_user: event.item_user.clone().filter(|u| !u.is_empty()),
        },
        supersedes: None,
    })
}

fn normalize_membership(
    event: SlackEvent,
    kind: EventKind,
    sequence: Option<u64>,
) -> Result<CanonicalEvent, PipelineError> {
    let channel = require(event.channel.as_deref(), "channel")?;
    let user = require(event.user.as_deref(), "user")?;
    let (ts, micros) = event.timestamp()?;
    let prefix = if kind == EventKind::Join { "join" } else { "leave" };

    Ok(CanonicalEvent {
        event_id: format!("{}:{}:{}:{}", prefix, channel, user, ts),
        channel_id: channel.to_string(),
        user_id: user.to_string(),
        kind,
        logical_timestamp: micros,
        sequence,
        payload: EventPayload::Membership,
        supersedes: None,
    })
}

/// Catch-all for kinds without a mapping. Reads the raw value leniently:
/// `channel` and `user` may be ids or objects carrying an `id`.
fn normalize_unknown(
    raw: &Value,
    raw_type: String,
    sequence: Option<u64>,
    envelope_id: Option<String>,
) -> Result<CanonicalEvent, PipelineError> {
    let channel = id_field(raw, "channel")
        .or_else(|| str_field(raw, "channel_id"))
        .or_else(|| raw.get("item").and_then(|i| str_field(i, "channel")))
        .filter(|c| !c.is_empty())
        .unwrap_or(UNATTRIBUTED)
        .to_string();
    let user = id_field(raw, "user")
        .or_else(|| str_field(raw, "user_id"))
        .filter(|u| !u.is_empty())
        .unwrap_or(UNATTRIBUTED)
        .to_string();
    let (ts, micros) = timestamp(raw.get("ts"), raw.get("event_ts"))?;
    let event_id =
        envelope_id.unwrap_or_else(|| format!("evt:{}:{}:{}", raw_type, channel, ts));

    Ok(CanonicalEvent {
        event_id,
        channel_id: channel,
        user_id: user,
        kind: EventKind::Unknown,
        logical_timestamp: micros,
        sequence,
        payload: EventPayload::Other { raw_type },
        supersedes: None,
    })
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

/// A string id, or the `id` of an object.
fn id_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    match value.get(field)? {
        Value::String(s) => Some(s),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn require<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, PipelineError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PipelineError::malformed(format!("missing {}", field)))
}

/// The event's own timestamp: `ts`, falling back to `event_ts`.
fn timestamp(ts: Option<&Value>, event_ts: Option<&Value>) -> Result<(String, i64), PipelineError> {
    let raw = ts
        .filter(|v| !v.is_null())
        .or(event_ts.filter(|v| !v.is_null()))
        .ok_or_else(|| PipelineError::malformed("missing ts"))?;
    let ts = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(PipelineError::malformed(format!("invalid ts {}", other))),
    };
    let micros = parse_slack_ts(&ts)
        .ok_or_else(|| PipelineError::malformed(format!("invalid ts '{}'", ts)))?;
    Ok((ts, micros))
}

/// Parse a Slack timestamp (`"1700000000.000100"`) into microseconds.
///
/// Whole seconds without a fraction are accepted. Fractions longer than
/// six digits are truncated.
pub fn parse_slack_ts(ts: &str) -> Option<i64> {
    let ts = ts.trim();
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let mut micros_str: String = frac.chars().take(6).collect();
    while micros_str.len() < 6 {
        micros_str.push('0');
    }
    let micros: i64 = micros_str.parse().ok()?;
    secs.checked_mul(1_000_000)?.checked_add(micros)
}

/// Inverse of [`parse_slack_ts`].
pub fn format_slack_ts(micros: i64) -> String {
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_slack_ts() {
        assert_eq!(parse_slack_ts("1700000000.000100"), Some(1_700_000_000_000_100));
        assert_eq!(parse_slack_ts("12"), Some(12_000_000));
        assert_eq!(parse_slack_ts("1.5"), Some(1_500_000));
        assert_eq!(parse_slack_ts("abc"), None);
        assert_eq!(parse_slack_ts(""), None);
        assert_eq!(format_slack_ts(1_700_000_000_000_100), "1700000000.000100");
    }

    #[test]
    fn test_plain_post_in_envelope() {
        let raw = json!({
            "type": "event_callback",
            "event_id": "Ev01",
            "event_time": 1700000000,
            "seq": 7,
            "event": {
                "type": "message",
                "channel": "C1",
                "user": "U1",
                "text": "We shipped the billing fix",
                "ts": "1700000000.000100"
            }
        });
        let ev = normalize(&raw).unwrap();
        assert_eq!(ev.event_id, "msg:C1:1700000000.000100");
        assert_eq!(ev.kind, EventKind::Post);
        assert_eq!(ev.sequence, Some(7));
        assert_eq!(ev.text(), Some("We shipped the billing fix"));
        assert_eq!(ev.supersedes, None);
    }

    #[test]
    fn test_bare_and_enveloped_post_share_id() {
        let bare = json!({
            "type": "message", "channel": "C1", "user": "U1",
            "text": "hi", "ts": "1700000000.000100"
        });
        let wrapped = json!({"type": "event_callback", "event_id": "Ev9", "event": bare.clone()});
        assert_eq!(normalize(&bare).unwrap(), normalize(&wrapped).unwrap());
    }

    #[test]
    fn test_message_changed() {
        let raw = json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "ts": "1700000050.000000",
            "message": {
                "user": "U1",
                "text": "We shipped the billing fix today",
                "ts": "1700000000.000100",
                "edited": {"user": "U1", "ts": "1700000040.000000"}
            }
        });
        let ev = normalize(&raw).unwrap();
        assert_eq!(ev.kind, EventKind::Edit);
        assert_eq!(ev.user_id, "U1");
        assert_eq!(ev.supersedes.as_deref(), Some("msg:C1:1700000000.000100"));
        assert_eq!(ev.logical_timestamp, 1_700_000_040_000_000);
        assert_eq!(ev.event_id, "edit:C1:1700000000.000100:1700000040.000000");
    }

    #[test]
    fn test_message_deleted_uses_previous_author() {
        let raw = json!({
            "type": "message",
            "subtype": "message_deleted",
            "channel": "C1",
            "ts": "1700000090.000000",
            "deleted_ts": "1700000000.000100",
            "previous_message": {"user": "U1", "text": "old", "ts": "1700000000.000100"}
        });
        let ev = normalize(&raw).unwrap();
        assert_eq!(ev.kind, EventKind::Delete);
        assert_eq!(ev.user_id, "U1");
        assert_eq!(ev.payload, EventPayload::Empty);
        assert_eq!(ev.supersedes.as_deref(), Some("msg:C1:1700000000.000100"));
    }

    #[test]
    fn test_reaction_added() {
        let raw = json!({
            "type": "reaction_added",
            "user": "U2",
            "reaction": "tada",
            "item_user": "U1",
            "item": {"type": "message", "channel": "C1", "ts": "1700000000.000100"},
            "event_ts": "1700000100.000000"
        });
        let ev = normalize(&raw).unwrap();
        assert_eq!(ev.kind, EventKind::ReactionAdd);
        assert_eq!(ev.channel_id, "C1");
        assert_eq!(ev.user_id, "U2");
        match ev.payload {
            EventPayload::Reaction { name, item_user, .. } => {
                assert_eq!(name, "tada");
                assert_eq!(item_user.as_deref(), Some("U1"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_join_variants() {
        let member = json!({
            "type": "member_joined_channel", "user": "U3", "channel": "C1",
            "event_ts": "1700000000.000001"
        });
        let subtype = json!({
            "type": "message", "subtype": "channel_join", "user": "U3", "channel": "C1",
            "ts": "1700000000.000001", "text": "<@U3> has joined the channel"
        });
        assert_eq!(normalize(&member).unwrap().kind, EventKind::Join);
        assert_eq!(normalize(&subtype).unwrap().kind, EventKind::Join);
        let left = json!({
            "type": "member_left_channel", "user": "U3", "channel": "C1",
            "event_ts": "1700000500.000001"
        });
        assert_eq!(normalize(&left).unwrap().kind, EventKind::Leave);
    }

    #[test]
    fn test_unknown_kind_does_not_fail() {
        let raw = json!({"type": "pin_added", "user": "U1", "channel_id": "C1", "event_ts": "1.0"});
        let ev = normalize(&raw).unwrap();
        assert_eq!(ev.kind, EventKind::Unknown);
        assert_eq!(ev.channel_id, "C1");
        assert_eq!(ev.user_id, "U1");
        assert_eq!(
            ev.payload,
            EventPayload::Other {
                raw_type: "pin_added".into()
            }
        );
    }

    #[test]
    fn test_unknown_kinds_with_object_fields() {
        let created = json!({
            "type": "channel_created",
            "channel": {"id": "C9", "name": "new", "creator": "U4"},
            "event_ts": "1700000000.000100"
        });
        let ev = normalize(&created).unwrap();
        assert_eq!(ev.kind, EventKind::Unknown);
        assert_eq!(ev.channel_id, "C9");
        assert_eq!(ev.user_id, UNATTRIBUTED);
        assert_eq!(ev.event_id, "evt:channel_created:C9:1700000000.000100");

        let renamed = json!({
            "type": "channel_rename",
            "channel": {"id": "C9", "name": "renamed", "created": 1360782804},
            "event_ts": "1700000001.000100"
        });
        assert_eq!(normalize(&renamed).unwrap().channel_id, "C9");

        let user_change = json!({
            "type": "user_change",
            "user": {"id": "U7", "name": "sam", "profile": {"real_name": "Sam"}},
            "event_ts": "1700000002.000100"
        });
        let ev = normalize(&user_change).unwrap();
        assert_eq!(ev.kind, EventKind::Unknown);
        assert_eq!(ev.user_id, "U7");
        assert_eq!(ev.channel_id, UNATTRIBUTED);

        let team_join = json!({
            "type": "event_callback",
            "event_id": "Ev42",
            "event": {
                "type": "team_join",
                "user": {"id": "U8", "deleted": false},
                "event_ts": 1700000003
            }
        });
        let ev = normalize(&team_join).unwrap();
        assert_eq!(ev.event_id, "Ev42");
        assert_eq!(ev.user_id, "U8");

        let odd_subtype = json!({
            "type": "message", "subtype": "channel_topic", "channel": "C1",
            "user": "U1", "topic": "billing", "ts": "1700000004.000100"
        });
        assert_eq!(normalize(&odd_subtype).unwrap().kind, EventKind::Unknown);
    }

    #[test]
    fn test_malformed_events() {
        for raw in [
            json!({"channel": "C1", "user": "U1", "ts": "1.0"}),
            json!({"type": "message", "user": "U1", "ts": "1.0"}),
            json!({"type": "message", "channel": "C1", "ts": "1.0"}),
            json!({"type": "message", "channel": "C1", "user": "U1"}),
            json!({"type": "message", "channel": "C1", "user": "U1", "ts": "yesterday"}),
            json!({"type": "message", "subtype": "message_changed", "channel": "C1", "ts": "1.0"}),
            json!({"type": "reaction_added", "user": "U1", "reaction": "x", "event_ts": "1.0"}),
            json!({"type": "event_callback", "event_id": "Ev1"}),
            json!("just a string"),
        ] {
            assert!(
                matches!(normalize(&raw), Err(PipelineError::MalformedEvent(_))),
                "expected malformed: {}",
                raw
            );
        }
    }

    #[test]
    fn test_deterministic() {
        let raw = json!({
            "type": "reaction_removed", "user": "U2", "reaction": "eyes",
            "item": {"channel": "C1", "ts": "5.000001"}, "event_ts": "6.000000"
        });
        assert_eq!(normalize(&raw).unwrap(), normalize(&raw).unwrap());
    }
}
