use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Core agent loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique ID for this agent instance.
    #[serde(default = "d_agent_id")]
    pub agent_id: String,

    /// Default model passed to the provider when no override applies.
    #[serde(default)]
    pub model: String,

    /// Tool-loop iteration cap per dialog turn.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: usize,

    /// Context window size in tokens; compaction triggers at 85% of this.
    #[serde(default = "d_context_window")]
    pub context_window: u64,

    /// Ceiling for one entire run, in seconds.
    #[serde(default = "d_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Whether run/assistant/tool events are published to the bus.
    #[serde(default = "d_true")]
    pub stream_events: bool,

    /// Whether the final reply goes through shaping/suppression.
    #[serde(default = "d_true")]
    pub reply_shaping: bool,

    /// Token the model emits to suppress the outbound reply entirely.
    #[serde(default = "d_no_reply_token")]
    pub no_reply_token: String,

    /// Reject file paths and shell commands outside the workspace.
    #[serde(default)]
    pub restrict_to_workspace: bool,

    /// Whether the active model accepts image content parts.
    #[serde(default = "d_true")]
    pub supports_vision: bool,

    /// How long a tool approval prompt waits for a user decision, seconds.
    #[serde(default = "d_approval_timeout")]
    pub approval_timeout_s: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: d_agent_id(),
            model: String::new(),
            max_iterations: d_max_iterations(),
            context_window: d_context_window(),
            timeout_seconds: d_timeout_seconds(),
            stream_events: true,
            reply_shaping: true,
            no_reply_token: d_no_reply_token(),
            restrict_to_workspace: false,
            supports_vision: true,
            approval_timeout_s: d_approval_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a new inbound message interacts with in-flight work on its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Always enqueue a new run.
    #[default]
    Queue,
    /// Merge into a recently queued run within the collect window.
    Collect,
    /// Inject into the running run's steer buffer.
    Steer,
    /// Replace the most recent queued run's content.
    Followup,
    /// Steer the running run and replace the newest queued draft.
    SteerBacklog,
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueMode::Queue => "queue",
            QueueMode::Collect => "collect",
            QueueMode::Steer => "steer",
            QueueMode::Followup => "followup",
            QueueMode::SteerBacklog => "steer_backlog",
        }
    }
}

/// Run queue / backpressure configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub mode: QueueMode,

    /// When true, a process-wide semaphore of `max_concurrency` permits is
    /// acquired before the per-session lock.
    #[serde(default, rename = "global")]
    pub global_cap: bool,

    #[serde(default = "d_max_concurrency")]
    pub max_concurrency: usize,

    /// Collect-mode merge window.
    #[serde(default = "d_collect_window_ms")]
    pub collect_window_ms: u64,

    /// Queued runs per session beyond which the oldest draft is replaced.
    #[serde(default = "d_max_backlog")]
    pub max_backlog: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Queue,
            global_cap: false,
            max_concurrency: d_max_concurrency(),
            collect_window_ms: d_collect_window_ms(),
            max_backlog: d_max_backlog(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionsPolicyConfig {
    /// Reset a session when idle longer than this many minutes. 0 disables.
    #[serde(default)]
    pub idle_reset_minutes: u64,

    /// Cron expression for bulk scheduled resets (consumed by the scheduler
    /// host; empty disables).
    #[serde(default)]
    pub scheduled_reset_cron: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    AlwaysAllow,
    AlwaysAsk,
    AlwaysDeny,
}

/// Per-tool-class approval policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolApprovalConfig {
    #[serde(default = "d_ask")]
    pub exec: ApprovalMode,
    #[serde(default = "d_ask")]
    pub browser: ApprovalMode,
    #[serde(default = "d_allow")]
    pub web_fetch: ApprovalMode,
    #[serde(default = "d_ask")]
    pub write_file: ApprovalMode,
}

impl Default for ToolApprovalConfig {
    fn default() -> Self {
        Self::from_profile(ApprovalProfile::Coding)
    }
}

/// Named presets for the approval table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalProfile {
    Coding,
    Messaging,
    Automation,
    LockedDown,
}

impl ToolApprovalConfig {
    pub fn from_profile(profile: ApprovalProfile) -> Self {
        use ApprovalMode::*;
        match profile {
            ApprovalProfile::Coding => Self {
                exec: AlwaysAsk,
                browser: AlwaysAsk,
                web_fetch: AlwaysAllow,
                write_file: AlwaysAsk,
            },
            ApprovalProfile::Messaging => Self {
                exec: AlwaysDeny,
                browser: AlwaysDeny,
                web_fetch: AlwaysAllow,
                write_file: AlwaysDeny,
            },
            ApprovalProfile::Automation => Self {
                exec: AlwaysAllow,
                browser: AlwaysDeny,
                web_fetch: AlwaysAllow,
                write_file: AlwaysAsk,
            },
            ApprovalProfile::LockedDown => Self {
                exec: AlwaysDeny,
                browser: AlwaysDeny,
                web_fetch: AlwaysDeny,
                write_file: AlwaysDeny,
            },
        }
    }

    /// Resolve the approval mode for a tool by name. Tools outside the known
    /// classes are always allowed.
    pub fn mode_for(&self, tool_name: &str) -> ApprovalMode {
        match tool_name {
            "exec" | "process" => self.exec,
            "browser" => self.browser,
            "web_fetch" => self.web_fetch,
            "write_file" | "edit_file" | "apply_patch" => self.write_file,
            _ => ApprovalMode::AlwaysAllow,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thinking mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reasoning-effort override carried per session and per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    Off,
    Low,
    Medium,
    High,
}

impl ThinkingMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Token budget handed to providers that support reasoning budgets.
    pub fn token_budget(self) -> u64 {
        match self {
            Self::Off => 0,
            Self::Low => 1024,
            Self::Medium => 4096,
            Self::High => 16384,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_agent_id() -> String {
    "default".into()
}
fn d_max_iterations() -> usize {
    20
}
fn d_context_window() -> u64 {
    32_768
}
fn d_timeout_seconds() -> u64 {
    180
}
fn d_no_reply_token() -> String {
    "NO_REPLY".into()
}
fn d_approval_timeout() -> u64 {
    60
}
fn d_max_concurrency() -> usize {
    4
}
fn d_collect_window_ms() -> u64 {
    1200
}
fn d_max_backlog() -> usize {
    8
}
fn d_true() -> bool {
    true
}
fn d_ask() -> ApprovalMode {
    ApprovalMode::AlwaysAsk
}
fn d_allow() -> ApprovalMode {
    ApprovalMode::AlwaysAllow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_table_routes_by_tool_name() {
        let config = ToolApprovalConfig::default();
        assert_eq!(config.mode_for("exec"), ApprovalMode::AlwaysAsk);
        assert_eq!(config.mode_for("process"), ApprovalMode::AlwaysAsk);
        assert_eq!(config.mode_for("apply_patch"), ApprovalMode::AlwaysAsk);
        assert_eq!(config.mode_for("web_fetch"), ApprovalMode::AlwaysAllow);
        assert_eq!(config.mode_for("read_file"), ApprovalMode::AlwaysAllow);
    }

    #[test]
    fn locked_down_profile_denies_everything() {
        let config = ToolApprovalConfig::from_profile(ApprovalProfile::LockedDown);
        assert_eq!(config.mode_for("exec"), ApprovalMode::AlwaysDeny);
        assert_eq!(config.mode_for("web_fetch"), ApprovalMode::AlwaysDeny);
        assert_eq!(config.mode_for("write_file"), ApprovalMode::AlwaysDeny);
    }

    #[test]
    fn queue_mode_parses_snake_case() {
        let config: QueueConfig =
            toml::from_str("mode = \"steer_backlog\"\nglobal = true").unwrap();
        assert_eq!(config.mode, QueueMode::SteerBacklog);
        assert!(config.global_cap);
    }

    #[test]
    fn thinking_mode_parse_rejects_unknown() {
        assert_eq!(ThinkingMode::parse("HIGH"), Some(ThinkingMode::High));
        assert_eq!(ThinkingMode::parse("ultra"), None);
        assert_eq!(ThinkingMode::Medium.token_budget(), 4096);
    }
}
