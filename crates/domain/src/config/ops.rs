use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_messages_per_minute")]
    pub messages_per_minute: u32,
    #[serde(default = "d_tool_calls_per_minute")]
    pub tool_calls_per_minute: u32,
    /// Optional JSON state file for crash-safe, cross-process buckets.
    #[serde(default)]
    pub store_path: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            messages_per_minute: d_messages_per_minute(),
            tool_calls_per_minute: d_tool_calls_per_minute(),
            store_path: String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Distributed fleet tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_node_id")]
    pub node_id: String,
    /// Node ids allowed to register besides the local node. Empty = open.
    #[serde(default)]
    pub peer_allowlist: Vec<String>,
    #[serde(default = "d_heartbeat_timeout")]
    pub heartbeat_timeout_s: u64,
    #[serde(default = "d_max_tasks")]
    pub max_tasks: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: d_node_id(),
            peer_allowlist: Vec::new(),
            heartbeat_timeout_s: d_heartbeat_timeout(),
            max_tasks: d_max_tasks(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alerts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes alert events to channel aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    /// Event name, or `*` for all events.
    pub event: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Alias → channel target (e.g. `ops` → `telegram:12345`).
    #[serde(default)]
    pub channels: HashMap<String, String>,
    #[serde(default)]
    pub rules: Vec<AlertRuleConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage / cost
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-model pricing in USD per 1M tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct UsagePrice {
    #[serde(default)]
    pub input_per_1m_tokens_usd: f64,
    #[serde(default)]
    pub output_per_1m_tokens_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default)]
    pub pricing: HashMap<String, UsagePrice>,
    #[serde(default = "d_aggregation_windows")]
    pub aggregation_windows: Vec<String>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            pricing: HashMap::new(),
            aggregation_windows: d_aggregation_windows(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retention / compliance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-domain retention windows in days. Domain-specific values fall back
/// to the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "d_retention_days")]
    pub default_days: u32,
    #[serde(default)]
    pub sessions_days: Option<u32>,
    #[serde(default)]
    pub runs_days: Option<u32>,
    #[serde(default)]
    pub audit_days: Option<u32>,
    #[serde(default)]
    pub memory_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_days: d_retention_days(),
            sessions_days: None,
            runs_days: None,
            audit_days: None,
            memory_days: None,
        }
    }
}

impl RetentionConfig {
    pub fn days_for(&self, domain: &str) -> u32 {
        let specific = match domain {
            "sessions" => self.sessions_days,
            "runs" => self.runs_days,
            "audit" => self.audit_days,
            "memory" => self.memory_days,
            _ => None,
        };
        specific.unwrap_or(self.default_days).max(1)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Secrets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsBackend {
    /// Keychain when usable, else the encrypted file.
    #[default]
    Auto,
    Keychain,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub backend: SecretsBackend,
    #[serde(default = "d_secrets_namespace")]
    pub namespace: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: SecretsBackend::Auto,
            namespace: d_secrets_namespace(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook signatures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Signed timestamps older than this are rejected.
    #[serde(default = "d_replay_window")]
    pub replay_window_s: u64,
    /// Secret-store key holding the shared webhook secret.
    #[serde(default)]
    pub secret_key: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            replay_window_s: d_replay_window(),
            secret_key: String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Minimal,
    #[default]
    Standard,
    Verbose,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub level: AuditLevel,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_messages_per_minute() -> u32 {
    20
}
fn d_tool_calls_per_minute() -> u32 {
    60
}
fn d_node_id() -> String {
    "local-node".into()
}
fn d_heartbeat_timeout() -> u64 {
    90
}
fn d_max_tasks() -> usize {
    1000
}
fn d_aggregation_windows() -> Vec<String> {
    vec!["1h".into(), "1d".into(), "30d".into()]
}
fn d_retention_days() -> u32 {
    60
}
fn d_secrets_namespace() -> String {
    "courier".into()
}
fn d_replay_window() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_falls_back_to_default() {
        let config = RetentionConfig {
            default_days: 30,
            runs_days: Some(7),
            ..Default::default()
        };
        assert_eq!(config.days_for("runs"), 7);
        assert_eq!(config.days_for("sessions"), 30);
        assert_eq!(config.days_for("unknown"), 30);
    }

    #[test]
    fn retention_floor_is_one_day() {
        let config = RetentionConfig {
            default_days: 0,
            ..Default::default()
        };
        assert_eq!(config.days_for("sessions"), 1);
    }

    #[test]
    fn secrets_backend_parses() {
        let config: SecretsConfig = toml::from_str("backend = \"file\"").unwrap();
        assert_eq!(config.backend, SecretsBackend::File);
    }
}
