use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shell exec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resource limits applied to sandboxed shell execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecResourceLimits {
    #[serde(default = "d_cpu_seconds")]
    pub cpu_seconds: u64,
    #[serde(default = "d_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "d_file_size_mb")]
    pub file_size_mb: u64,
    #[serde(default = "d_max_processes")]
    pub max_processes: u64,
}

impl Default for ExecResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: d_cpu_seconds(),
            memory_mb: d_memory_mb(),
            file_size_mb: d_file_size_mb(),
            max_processes: d_max_processes(),
        }
    }
}

/// Shell exec tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecToolConfig {
    /// Per-command timeout in seconds.
    #[serde(default = "d_exec_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub resource_limits: ExecResourceLimits,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            timeout: d_exec_timeout(),
            resource_limits: ExecResourceLimits::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Docker sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    #[default]
    Off,
    /// Sandbox every agent except the main one.
    NonMain,
    /// Sandbox every shell command.
    All,
}

/// Which long-lived container a command runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxScope {
    /// One container per (agent, session).
    Session,
    /// One container per agent id.
    #[default]
    Agent,
    /// One container for the whole process.
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceAccess {
    None,
    Ro,
    #[default]
    Rw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub mode: SandboxMode,
    #[serde(default)]
    pub scope: SandboxScope,
    #[serde(default)]
    pub workspace_access: WorkspaceAccess,
    #[serde(default = "d_sandbox_image")]
    pub image: String,
    #[serde(default = "d_prune_idle")]
    pub prune_idle_seconds: u64,
    #[serde(default = "d_prune_max_age")]
    pub prune_max_age_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Off,
            scope: SandboxScope::Agent,
            workspace_access: WorkspaceAccess::Rw,
            image: d_sandbox_image(),
            prune_idle_seconds: d_prune_idle(),
            prune_max_age_seconds: d_prune_max_age(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hook directory relative to the workspace.
    #[serde(default = "d_hooks_path")]
    pub path: String,
    #[serde(default = "d_hooks_config_file")]
    pub config_file: String,
    #[serde(default = "d_hook_timeout")]
    pub timeout_seconds: u64,
    /// When true, hook commands pass the allow/deny policy below.
    #[serde(default = "d_true")]
    pub safe_mode: bool,
    #[serde(default)]
    pub allow_command_prefixes: Vec<String>,
    #[serde(default = "d_hook_deny_patterns")]
    pub deny_command_patterns: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: d_hooks_path(),
            config_file: d_hooks_config_file(),
            timeout_seconds: d_hook_timeout(),
            safe_mode: true,
            allow_command_prefixes: Vec::new(),
            deny_command_patterns: d_hook_deny_patterns(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_exec_timeout() -> u64 {
    60
}
fn d_cpu_seconds() -> u64 {
    30
}
fn d_memory_mb() -> u64 {
    512
}
fn d_file_size_mb() -> u64 {
    64
}
fn d_max_processes() -> u64 {
    64
}
fn d_sandbox_image() -> String {
    "courier-sandbox:bookworm-slim".into()
}
fn d_prune_idle() -> u64 {
    1800
}
fn d_prune_max_age() -> u64 {
    21_600
}
fn d_hooks_path() -> String {
    "hooks".into()
}
fn d_hooks_config_file() -> String {
    "hooks.json".into()
}
fn d_hook_timeout() -> u64 {
    8
}
fn d_true() -> bool {
    true
}
fn d_hook_deny_patterns() -> Vec<String> {
    vec![
        "rm -rf /".into(),
        "mkfs".into(),
        "shutdown".into(),
        "reboot".into(),
        "poweroff".into(),
        ":(){:|:&};:".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.mode, SandboxMode::Off);
        assert_eq!(config.scope, SandboxScope::Agent);
        assert_eq!(config.workspace_access, WorkspaceAccess::Rw);
        assert!(config.prune_idle_seconds >= 30);
    }

    #[test]
    fn sandbox_mode_parses_snake_case() {
        let config: SandboxConfig = toml::from_str("mode = \"non_main\"").unwrap();
        assert_eq!(config.mode, SandboxMode::NonMain);
    }

    #[test]
    fn hook_deny_defaults_include_power_commands() {
        let config = HooksConfig::default();
        assert!(config.deny_command_patterns.iter().any(|p| p == "shutdown"));
        assert!(config.safe_mode);
    }
}
