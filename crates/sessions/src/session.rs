//! A conversation session: ordered messages plus compaction summary and
//! free-form metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::run::RunState;

/// One persisted conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation thread keyed by `channel:chat_id` (or an override).
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
    pub summary: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            summary: String::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(SessionMessage {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Recent history in (role, content) form, summary prepended as a system
    /// message when present.
    pub fn history(&self, max_messages: usize) -> Vec<(String, String)> {
        let start = self.messages.len().saturating_sub(max_messages);
        let mut out: Vec<(String, String)> = Vec::with_capacity(self.messages.len() - start + 1);
        if !self.summary.is_empty() {
            out.push((
                "system".to_owned(),
                format!("Conversation summary:\n{}", self.summary),
            ));
        }
        for msg in &self.messages[start..] {
            out.push((msg.role.clone(), msg.content.clone()));
        }
        out
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }

    /// Store lightweight run metadata on the session.
    pub fn set_last_run(&mut self, run: &RunState) {
        if let Ok(value) = serde_json::to_value(run) {
            self.metadata.insert("last_run".into(), value);
        }
        self.metadata
            .insert("last_run_id".into(), Value::String(run.run_id.clone()));
        self.updated_at = Utc::now();
    }

    /// Per-session thinking mode, when set and valid.
    pub fn thinking_mode(&self) -> Option<String> {
        let raw = self
            .metadata
            .get("thinking_mode")
            .and_then(Value::as_str)?
            .trim()
            .to_ascii_lowercase();
        match raw.as_str() {
            "off" | "low" | "medium" | "high" => Some(raw),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_prepends_summary() {
        let mut session = Session::new("cli:direct");
        session.summary = "previous context".into();
        session.add_message("user", "hi");
        session.add_message("assistant", "hello");

        let history = session.history(50);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].0, "system");
        assert!(history[0].1.contains("previous context"));
        assert_eq!(history[2].1, "hello");
    }

    #[test]
    fn history_truncates_to_recent() {
        let mut session = Session::new("cli:direct");
        for i in 0..10 {
            session.add_message("user", format!("m{i}"));
        }
        let history = session.history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].1, "m7");
    }

    #[test]
    fn last_run_snapshot_lands_in_metadata() {
        let mut session = Session::new("cli:direct");
        let run = RunState::new("abc123def456", "cli:direct");
        session.set_last_run(&run);
        assert_eq!(
            session.metadata.get("last_run_id").and_then(Value::as_str),
            Some("abc123def456")
        );
        assert!(session.metadata.get("last_run").is_some());
    }

    #[test]
    fn thinking_mode_validation() {
        let mut session = Session::new("k");
        assert_eq!(session.thinking_mode(), None);
        session
            .metadata
            .insert("thinking_mode".into(), Value::String("HIGH".into()));
        assert_eq!(session.thinking_mode().as_deref(), Some("high"));
        session
            .metadata
            .insert("thinking_mode".into(), Value::String("turbo".into()));
        assert_eq!(session.thinking_mode(), None);
    }
}
