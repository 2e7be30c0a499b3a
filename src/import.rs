//! Slack history import.
//!
//! Reads channel histories from a directory and turns every stored message
//! into the raw Events API payloads it implies, so history flows through
//! the same normalizer as live events.
//!
//! Two layouts are recognized:
//!
//! | Layout | Channel id |
//! |--------|------------|
//! | `{name}_messages.json` (one array per channel) | `id` in `{name}_channel_info.json`, else `{name}` |
//! | `{name}/{YYYY-MM-DD}.json` (Slack workspace export) | `id` in `channels.json`, else `{name}` |
//!
//! Each message yields a post; an `edited` marker adds an edit; every
//! user in `reactions[].users` adds a `reaction_added`.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

use rapport_core::normalize::parse_slack_ts;

#[derive(Debug, Clone)]
pub struct ChannelHistory {
    pub channel_id: String,
    /// Messages in timestamp order.
    pub messages: Vec<Value>,
}

/// Load every channel history under `dir`, sorted by channel id.
pub fn load_history(dir: &Path) -> Result<Vec<ChannelHistory>> {
    if !dir.is_dir() {
        anyhow::bail!("Import directory does not exist: {}", dir.display());
    }
    let export_ids = read_channels_json(&dir.join("channels.json"))?;
    let mut by_channel: HashMap<String, Vec<Value>> = HashMap::new();

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if path.is_dir() {
            let channel = export_ids.get(&name).cloned().unwrap_or(name);
            let mut days: Vec<_> = std::fs::read_dir(&path)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|x| x == "json"))
                .collect();
            days.sort();
            for day in days {
                by_channel
                    .entry(channel.clone())
                    .or_default()
                    .extend(read_message_array(&day)?);
            }
        } else if let Some(stem) = name.strip_suffix("_messages.json") {
            let info = dir.join(format!("{}_channel_info.json", stem));
            let channel = read_channel_info_id(&info)?.unwrap_or_else(|| stem.to_string());
            by_channel
                .entry(channel)
                .or_default()
                .extend(read_message_array(&path)?);
        }
    }

    let mut histories: Vec<ChannelHistory> = by_channel
        .into_iter()
        .map(|(channel_id, mut messages)| {
            messages.sort_by_key(|m| {
                m.get("ts")
                    .and_then(Value::as_str)
                    .and_then(parse_slack_ts)
                    .unwrap_or(i64::MAX)
            });
            ChannelHistory {
                channel_id,
                messages,
            }
        })
        .collect();
    histories.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
    Ok(histories)
}

/// Raw events implied by one channel's history, in timestamp order.
pub fn synthesize_events(history: &ChannelHistory) -> Vec<Value> {
    let channel = history.channel_id.as_str();
    let mut out = Vec::new();

    for msg in &history.messages {
        let mut post = msg.clone();
        if let Some(obj) = post.as_object_mut() {
            obj.insert("channel".into(), json!(channel));
            obj.entry("type").or_insert_with(|| json!("message"));
            obj.remove("reactions");
        }
        out.push(post);

        let Some(ts) = msg.get("ts").and_then(Value::as_str) else {
            continue;
        };
        let author = msg.get("user").and_then(Value::as_str);

        if let (Some(edit_ts), Some(user)) = (
            msg.pointer("/edited/ts").and_then(Value::as_str),
            author,
        ) {
            out.push(json!({
                "type": "message",
                "subtype": "message_changed",
                "channel": channel,
                "ts": edit_ts,
                "message": {
                    "user": user,
                    "ts": ts,
                    "text": msg.get("text").cloned().unwrap_or(json!("")),
                    "edited": { "ts": edit_ts },
                },
            }));
        }

        let reactions = msg
            .get("reactions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for reaction in reactions {
            let Some(name) = reaction.get("name").and_then(Value::as_str) else {
                continue;
            };
            let users = reaction
                .get("users")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for user in users.iter().filter_map(Value::as_str) {
                out.push(json!({
                    "type": "reaction_added",
                    "user": user,
                    "reaction": name,
                    "item_user": author,
                    "item": { "type": "message", "channel": channel, "ts": ts },
                    "event_ts": ts,
                }));
            }
        }
    }
    out
}

fn read_message_array(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => anyhow::bail!("{} is not a JSON array of messages", path.display()),
    }
}

fn read_channel_info_id(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    let info: Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Ok(info.get("id").and_then(Value::as_str).map(str::to_string))
}

/// `channels.json` from a workspace export: name → id.
fn read_channels_json(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let list = read_message_array(path)?;
    Ok(list
        .iter()
        .filter_map(|c| {
            let name = c.get("name")?.as_str()?;
            let id = c.get("id")?.as_str()?;
            Some((name.to_string(), id.to_string()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::models::EventKind;
    use rapport_core::normalize::normalize;
    use tempfile::TempDir;

    fn history() -> Value {
        json!([
            {
                "type": "message",
                "user": "U2",
                "text": "second",
                "ts": "1700000100.000200"
            },
            {
                "type": "message",
                "user": "U1",
                "text": "first, edited",
                "ts": "1700000000.000100",
                "edited": { "user": "U1", "ts": "1700000050.000000" },
                "reactions": [{ "name": "tada", "users": ["U2", "U3"], "count": 2 }]
            }
        ])
    }

    #[test]
    fn loads_messages_file_with_channel_info() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("general_messages.json"), history().to_string()).unwrap();
        std::fs::write(
            dir.path().join("general_channel_info.json"),
            json!({ "id": "C042", "name": "general" }).to_string(),
        )
        .unwrap();

        let histories = load_history(dir.path()).unwrap();
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].channel_id, "C042");
        assert_eq!(histories[0].messages[0]["text"], "first, edited");
    }

    #[test]
    fn loads_workspace_export_layout() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("random")).unwrap();
        std::fs::write(dir.path().join("random/2023-11-14.json"), history().to_string()).unwrap();
        std::fs::write(
            dir.path().join("channels.json"),
            json!([{ "id": "C7", "name": "random" }]).to_string(),
        )
        .unwrap();

        let histories = load_history(dir.path()).unwrap();
        assert_eq!(histories[0].channel_id, "C7");
        assert_eq!(histories[0].messages.len(), 2);
    }

    #[test]
    fn synthesized_events_normalize() {
        let h = ChannelHistory {
            channel_id: "C1".into(),
            messages: history().as_array().unwrap().clone(),
        };
        let events: Vec<_> = synthesize_events(&h)
            .iter()
            .map(|raw| normalize(raw).unwrap())
            .collect();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Post,
                EventKind::Post,
                EventKind::Edit,
                EventKind::ReactionAdd,
                EventKind::ReactionAdd,
            ]
        );
        let edit = &events[2];
        assert_eq!(edit.supersedes.as_deref(), Some("msg:C1:1700000000.000100"));
        assert!(events[3..]
            .iter()
            .all(|e| matches!(&e.payload, rapport_core::models::EventPayload::Reaction { item_user: Some(u), .. } if u == "U1")));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_history(&dir.path().join("absent")).is_err());
    }
}
