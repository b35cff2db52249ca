//! Message tool — lets the model push a message to a chat channel
//! mid-run. Sends are recorded per run so the reply shaper can suppress
//! duplicate "message sent" confirmations.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use courier_domain::message::OutboundMessage;

use crate::{Tool, ToolContext};

/// One recorded send for a run.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

const MAX_SENDS_PER_RUN: usize = 10;

pub struct MessageTool {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    default_channel: Mutex<String>,
    default_chat_id: Mutex<String>,
    run_id: Mutex<String>,
    sent_by_run: Mutex<HashMap<String, Vec<RecordedSend>>>,
}

impl MessageTool {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            outbound,
            default_channel: Mutex::new(String::new()),
            default_chat_id: Mutex::new(String::new()),
            run_id: Mutex::new(String::new()),
            sent_by_run: Mutex::new(HashMap::new()),
        }
    }

    /// Sends recorded for a run (used by reply shaping).
    pub fn run_sends(&self, run_id: &str) -> Vec<RecordedSend> {
        self.sent_by_run
            .lock()
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop send records once a run has closed.
    pub fn clear_run_sends(&self, run_id: &str) {
        self.sent_by_run.lock().remove(run_id);
    }
}

#[async_trait::async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Use this when you want to communicate something."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message content to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Optional: target channel (telegram, whatsapp, etc.)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Optional: target chat/user ID"
                }
            },
            "required": ["content"]
        })
    }

    fn set_registry_context(&self, ctx: &ToolContext) {
        *self.default_channel.lock() = ctx.channel.clone();
        *self.default_chat_id.lock() = ctx.chat_id.clone();
        *self.run_id.lock() = ctx.run_id.clone();
    }

    async fn execute(&self, params: Value) -> String {
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        let channel = params
            .get("channel")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| self.default_channel.lock().clone());
        let chat_id = params
            .get("chat_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| self.default_chat_id.lock().clone());

        if channel.is_empty() || chat_id.is_empty() {
            return "Error: No target channel/chat specified".into();
        }

        let msg = OutboundMessage::new(channel.clone(), chat_id.clone(), content.clone());
        if self.outbound.send(msg).is_err() {
            return "Error sending message: outbound channel closed".into();
        }

        let run_id = self.run_id.lock().clone();
        if !run_id.is_empty() {
            let mut by_run = self.sent_by_run.lock();
            let entries = by_run.entry(run_id).or_default();
            entries.push(RecordedSend {
                channel: channel.clone(),
                chat_id: chat_id.clone(),
                content,
            });
            if entries.len() > MAX_SENDS_PER_RUN {
                let excess = entries.len() - MAX_SENDS_PER_RUN;
                entries.drain(..excess);
            }
        }

        format!("Message sent to {channel}:{chat_id}")
    }
}
