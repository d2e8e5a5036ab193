// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use nils_model::Message;

/// The durable form of a session: everything needed to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    /// Snapshot of the configuration the session was started with, so a
    /// resume replays with the same budgets even if the config file changed.
    pub config: Value,
    pub messages: Vec<Message>,
    /// Free-form context string shown to the model alongside the system prompt.
    #[serde(default)]
    pub context: String,
    /// Provider-side prefix-cache handle, when one is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_handle: Option<String>,
}

impl SessionRecord {
    pub fn new(working_dir: PathBuf, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            working_dir,
            config,
            messages: Vec::new(),
            context: String::new(),
            cache_handle: None,
        }
    }
}

/// An immutable snapshot of a session's message log, taken immediately
/// before compression mutates it.  Stored separately from the session so
/// restoration works even after repeated in-session compressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl BackupRecord {
    pub fn of(session: &SessionRecord, reason: &str) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("reason".into(), Value::String(reason.into()));
        metadata.insert(
            "message_count".into(),
            Value::from(session.messages.len()),
        );
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            created_at: Utc::now(),
            messages: session.messages.clone(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_have_distinct_ids() {
        let a = SessionRecord::new("/tmp".into(), Value::Null);
        let b = SessionRecord::new("/tmp".into(), Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn backup_snapshots_messages_and_session_id() {
        let mut s = SessionRecord::new("/tmp".into(), Value::Null);
        s.messages.push(Message::user("hello"));
        let b = BackupRecord::of(&s, "compression");
        assert_eq!(b.session_id, s.id);
        assert_eq!(b.messages.len(), 1);
        assert_eq!(b.metadata["reason"], "compression");
        assert_eq!(b.metadata["message_count"], 1);
    }

    #[test]
    fn session_record_round_trips_through_json() {
        let mut s = SessionRecord::new("/work".into(), serde_json::json!({"max_turns": 5}));
        s.messages.push(Message::system("prompt"));
        s.messages.push(Message::user("task"));
        let text = serde_json::to_string(&s).unwrap();
        let back: SessionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, s.id);
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.config["max_turns"], 5);
        assert_eq!(back.messages[1].content, "task");
    }
}
