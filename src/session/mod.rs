//! Session records and their lifecycle.
//!
//! A session pairs a host workspace with a sandbox and the agent's accumulated
//! conversation. [`SessionStore`] persists records; [`SessionManager`] keeps
//! them consistent with the runtime.

mod manager;
mod store;

pub use manager::SessionManager;
pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::runtime::SandboxStatus;

/// Short random identifier: the first 8 hex chars of a v4 UUID.
pub(crate) fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Lifecycle status persisted with a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Sandbox is running
    #[default]
    Active,
    /// Sandbox still exists but is not running
    Stale,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// One entry of the conversation payload.
///
/// Only `role` and `content` are named; everything else the agent runtime
/// stores on an entry is kept verbatim and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationEntry {
    /// Creates a plain text entry.
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            content: Value::String(content.to_string()),
            extra: Map::new(),
        }
    }
}

/// A persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Sandbox handle, bound once at creation
    pub container_id: String,
    /// Host workspace mounted into the sandbox
    pub workdir: PathBuf,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationEntry>,
    #[serde(default)]
    pub status: SessionStatus,
}

/// A session annotated with the sandbox state observed while listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub sandbox_status: SandboxStatus,
}

/// Speaker of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Human,
    Ai,
}

/// A user or assistant message, flattened to text for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptMessage {
    #[serde(rename = "type")]
    pub speaker: Speaker,
    pub content: String,
    pub id: String,
}

/// Projects the conversation payload into displayable messages.
///
/// Entries with a role other than `user` or `assistant` are skipped. The
/// payload itself is never modified.
pub fn transcript(entries: &[ConversationEntry]) -> Vec<TranscriptMessage> {
    let mut messages = Vec::new();
    for entry in entries {
        let (speaker, prefix) = match entry.role.as_deref() {
            Some("user") => (Speaker::Human, "user"),
            Some("assistant") => (Speaker::Ai, "ai"),
            _ => continue,
        };
        let id = format!("{prefix}-{}", messages.len());
        messages.push(TranscriptMessage {
            speaker,
            content: content_text(&entry.content),
            id,
        });
    }
    messages
}

fn content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::Object(obj) => obj
                    .get("text")
                    .map(|text| text.as_str().map_or_else(|| text.to_string(), str::to_string)),
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(obj) => match obj.get("text") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => content.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_short_id_is_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_conversation_entry_preserves_unknown_fields() {
        let raw = json!({
            "role": "assistant",
            "content": [{"type": "output_text", "text": "done"}],
            "id": "msg_123",
            "status": "completed"
        });
        let entry: ConversationEntry = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(entry.role.as_deref(), Some("assistant"));
        assert_eq!(entry.extra.get("id"), Some(&json!("msg_123")));
        assert_eq!(serde_json::to_value(&entry).unwrap(), raw);
    }

    #[test]
    fn test_entry_without_role_round_trips() {
        let raw = json!({"type": "function_call", "name": "run_shell", "arguments": "{}"});
        let entry: ConversationEntry = serde_json::from_value(raw.clone()).unwrap();
        assert!(entry.role.is_none());
        assert_eq!(serde_json::to_value(&entry).unwrap(), raw);
    }

    #[test]
    fn test_transcript_extracts_text() {
        let entries: Vec<ConversationEntry> = serde_json::from_value(json!([
            {"role": "user", "content": "build a server"},
            {"type": "function_call", "name": "write_file"},
            {"role": "assistant", "content": [
                {"type": "output_text", "text": "Server written."},
                {"type": "output_text", "text": "Run it with python."}
            ]},
            {"role": "assistant", "content": {"type": "output_text", "text": "Bye"}},
            {"role": "system", "content": "ignored"}
        ]))
        .unwrap();

        let messages = transcript(&entries);
        assert_eq!(
            messages,
            vec![
                TranscriptMessage {
                    speaker: Speaker::Human,
                    content: "build a server".to_string(),
                    id: "user-0".to_string(),
                },
                TranscriptMessage {
                    speaker: Speaker::Ai,
                    content: "Server written.\nRun it with python.".to_string(),
                    id: "ai-1".to_string(),
                },
                TranscriptMessage {
                    speaker: Speaker::Ai,
                    content: "Bye".to_string(),
                    id: "ai-2".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_session_status_defaults_to_active() {
        let session: Session = serde_json::from_value(json!({
            "session_id": "a1b2c3d4",
            "container_id": "abc",
            "workdir": "/tmp/session_a1b2c3d4",
            "created": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.conversation_history.is_empty());
        assert_eq!(session.last_task, "");
    }
}
