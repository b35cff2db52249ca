//! Inbound and outbound channel messages.
//!
//! These are the units that cross the bus between channel adapters and the
//! agent loop. An inbound message is immutable from the adapter's point of
//! view; the scheduler may merge queued copies under collect/followup modes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message arriving from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    /// Local file paths for attached media.
    #[serde(default)]
    pub media: Vec<String>,
    /// Free-form adapter metadata. Recognized keys: `session_key`,
    /// `message_id`, `model_override`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// The session key routing this message: the `session_key` metadata
    /// override when present, else `channel:chat_id`.
    pub fn session_key(&self) -> String {
        if let Some(value) = self.metadata.get("session_key").and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// The `model_override` metadata key, when non-empty.
    pub fn model_override(&self) -> Option<String> {
        self.metadata
            .get("model_override")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    }

    /// The `message_id` metadata key, rendered as a string.
    pub fn message_id(&self) -> Option<String> {
        match self.metadata.get("message_id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// A reply (or control signal) headed back to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Channel message id to reply to, when the adapter supports threading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Control signal instead of content, e.g. `typing_start`/`typing_stop`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            control: None,
            metadata: Map::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// A content-free control message (typing indicators).
    pub fn control(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: String::new(),
            reply_to: None,
            control: Some(action.into()),
            metadata: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_defaults_to_channel_chat() {
        let msg = InboundMessage::new("telegram", "alice", "chat42", "hi");
        assert_eq!(msg.session_key(), "telegram:chat42");
    }

    #[test]
    fn session_key_override_wins() {
        let mut msg = InboundMessage::new("telegram", "alice", "chat42", "hi");
        msg.metadata
            .insert("session_key".into(), Value::String("cli:direct".into()));
        assert_eq!(msg.session_key(), "cli:direct");
    }

    #[test]
    fn blank_session_key_override_is_ignored() {
        let mut msg = InboundMessage::new("telegram", "alice", "chat42", "hi");
        msg.metadata
            .insert("session_key".into(), Value::String("   ".into()));
        assert_eq!(msg.session_key(), "telegram:chat42");
    }

    #[test]
    fn model_override_empty_is_none() {
        let mut msg = InboundMessage::new("cli", "user", "direct", "hi");
        msg.metadata
            .insert("model_override".into(), Value::String("".into()));
        assert_eq!(msg.model_override(), None);
        msg.metadata
            .insert("model_override".into(), Value::String("openai/gpt-4o".into()));
        assert_eq!(msg.model_override().as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn message_id_stringifies_numbers() {
        let mut msg = InboundMessage::new("telegram", "alice", "chat42", "hi");
        msg.metadata
            .insert("message_id".into(), Value::Number(17.into()));
        assert_eq!(msg.message_id().as_deref(), Some("17"));
    }
}
