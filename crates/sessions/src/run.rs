//! Run state — the scheduling unit for one end-to-end message processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// One in-flight (or archived) unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub session_key: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub model: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_prompt_tokens: u64,
    #[serde(default)]
    pub usage_completion_tokens: u64,
    #[serde(default)]
    pub usage_total_tokens: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            session_key: session_key.into(),
            channel: String::new(),
            chat_id: String::new(),
            model: String::new(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            usage_prompt_tokens: 0,
            usage_completion_tokens: 0,
            usage_total_tokens: 0,
            error: None,
        }
    }

    /// Fresh 12-hex run id.
    pub fn new_run_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..12].to_owned()
    }
}
