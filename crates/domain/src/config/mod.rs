mod agent;
mod ops;
mod providers;
mod tools;

pub use agent::*;
pub use ops::*;
pub use providers::*;
pub use tools::*;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sessions: SessionsPolicyConfig,
    #[serde(default)]
    pub approval: ToolApprovalConfig,
    #[serde(default)]
    pub exec: ExecToolConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Config {
    /// Parse a TOML document into a config, surfacing parse errors as
    /// config errors.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }
}
