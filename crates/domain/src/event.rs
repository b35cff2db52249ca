//! Bus event family.
//!
//! Every run-lifecycle, assistant-delta, tool, hook, compaction, queue, and
//! session transition is published as one [`AgentEvent`]. The payload is a
//! sealed enum tagged by `type`; the envelope adds `kind`, run/session
//! routing fields, and an epoch-seconds timestamp so dashboard listeners can
//! consume the stream without knowing every payload shape.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lifecycle,
    Assistant,
    Tool,
    Hook,
    Compaction,
    Queue,
    Session,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStart {
        sender_id: String,
    },
    RunEnd {
        sender_id: String,
        has_response: bool,
    },
    RunError {
        sender_id: String,
        error: String,
    },
    RunCancelled {
        sender_id: String,
    },
    AssistantDelta {
        delta: String,
        index: usize,
    },
    ToolStart {
        tool_name: String,
        params: Value,
    },
    ToolEnd {
        tool_name: String,
        params: Value,
        ok: bool,
        result: Value,
        duration_ms: f64,
        #[serde(skip_serializing_if = "is_false")]
        blocked_by_hook: bool,
        #[serde(skip_serializing_if = "is_false")]
        rate_limited: bool,
    },
    HookError {
        event: String,
        errors: Vec<String>,
    },
    CompactionStart {
        reason: String,
        message_count: usize,
    },
    CompactionEnd {
        reason: String,
        ok: bool,
        summary_length: usize,
        remaining_messages: usize,
    },
    CompactionError {
        reason: String,
        error: String,
    },
    QueueUpdate {
        mode: String,
        reason: String,
    },
    RunSteer {
        source: String,
        sender_id: String,
        instruction_preview: String,
        pending: usize,
    },
    RunSteerApplied {
        count: usize,
    },
    SessionIdleReset,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::RunStart { .. }
            | EventPayload::RunEnd { .. }
            | EventPayload::RunError { .. }
            | EventPayload::RunCancelled { .. } => EventKind::Lifecycle,
            EventPayload::AssistantDelta { .. } => EventKind::Assistant,
            EventPayload::ToolStart { .. } | EventPayload::ToolEnd { .. } => EventKind::Tool,
            EventPayload::HookError { .. } => EventKind::Hook,
            EventPayload::CompactionStart { .. }
            | EventPayload::CompactionEnd { .. }
            | EventPayload::CompactionError { .. } => EventKind::Compaction,
            EventPayload::QueueUpdate { .. }
            | EventPayload::RunSteer { .. }
            | EventPayload::RunSteerApplied { .. } => EventKind::Queue,
            EventPayload::SessionIdleReset => EventKind::Session,
        }
    }

    /// Terminal lifecycle events are the only ones allowed through after a
    /// run id has been closed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::RunEnd { .. }
                | EventPayload::RunError { .. }
                | EventPayload::RunCancelled { .. }
        )
    }

    /// The wire `type` tag, for filtering without serializing.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::RunStart { .. } => "run_start",
            EventPayload::RunEnd { .. } => "run_end",
            EventPayload::RunError { .. } => "run_error",
            EventPayload::RunCancelled { .. } => "run_cancelled",
            EventPayload::AssistantDelta { .. } => "assistant_delta",
            EventPayload::ToolStart { .. } => "tool_start",
            EventPayload::ToolEnd { .. } => "tool_end",
            EventPayload::HookError { .. } => "hook_error",
            EventPayload::CompactionStart { .. } => "compaction_start",
            EventPayload::CompactionEnd { .. } => "compaction_end",
            EventPayload::CompactionError { .. } => "compaction_error",
            EventPayload::QueueUpdate { .. } => "queue_update",
            EventPayload::RunSteer { .. } => "run_steer",
            EventPayload::RunSteerApplied { .. } => "run_steer_applied",
            EventPayload::SessionIdleReset => "session_idle_reset",
        }
    }
}

/// One event on the run stream.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub kind: EventKind,
    pub run_id: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub chat_id: String,
    /// Epoch seconds.
    pub ts: f64,
}

impl AgentEvent {
    pub fn new(
        payload: EventPayload,
        run_id: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        let kind = payload.kind();
        Self {
            payload,
            kind,
            run_id: run_id.into(),
            session_key: session_key.into(),
            channel: String::new(),
            chat_id: String::new(),
            ts: now_ts(),
        }
    }

    pub fn with_route(mut self, channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        self.channel = channel.into();
        self.chat_id = chat_id.into();
        self
    }
}

/// Current time as epoch seconds, matching the event wire format.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_and_kind_on_wire() {
        let event = AgentEvent::new(
            EventPayload::RunStart {
                sender_id: "alice".into(),
            },
            "abc123",
            "telegram:42",
        )
        .with_route("telegram", "42");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_start");
        assert_eq!(json["kind"], "lifecycle");
        assert_eq!(json["run_id"], "abc123");
        assert_eq!(json["session_key"], "telegram:42");
        assert_eq!(json["channel"], "telegram");
        assert!(json["ts"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn terminal_classification() {
        assert!(EventPayload::RunEnd {
            sender_id: String::new(),
            has_response: true
        }
        .is_terminal());
        assert!(EventPayload::RunCancelled {
            sender_id: String::new()
        }
        .is_terminal());
        assert!(!EventPayload::AssistantDelta {
            delta: "x".into(),
            index: 0
        }
        .is_terminal());
    }

    #[test]
    fn kinds_cover_event_families() {
        assert_eq!(
            EventPayload::AssistantDelta {
                delta: String::new(),
                index: 0
            }
            .kind(),
            EventKind::Assistant
        );
        assert_eq!(
            EventPayload::QueueUpdate {
                mode: "queue".into(),
                reason: "overflow_replace".into()
            }
            .kind(),
            EventKind::Queue
        );
        assert_eq!(EventPayload::SessionIdleReset.kind(), EventKind::Session);
    }

    #[test]
    fn flags_omitted_when_false() {
        let event = AgentEvent::new(
            EventPayload::ToolEnd {
                tool_name: "exec".into(),
                params: serde_json::json!({}),
                ok: true,
                result: serde_json::json!("done"),
                duration_ms: 1.5,
                blocked_by_hook: false,
                rate_limited: false,
            },
            "r1",
            "s1",
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("blocked_by_hook"));
        assert!(!json.contains("rate_limited"));
    }
}
