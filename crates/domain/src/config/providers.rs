use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider candidates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One LLM endpoint candidate in failover order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCandidateConfig {
    /// Candidate name used in policy overrides and logs.
    pub name: String,
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`).
    #[serde(default)]
    pub api_base: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: String,
    /// Secret-store key holding the API key (preferred over the env var).
    #[serde(default)]
    pub api_key_secret: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Model used when neither the message nor the session overrides one.
    #[serde(default = "d_default_model")]
    pub default_model: String,
    /// Embedding model name for memory search.
    #[serde(default)]
    pub embedding_model: String,
    /// Ordered failover candidates; first is primary.
    #[serde(default)]
    pub candidates: Vec<ProviderCandidateConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_model: d_default_model(),
            embedding_model: String::new(),
            candidates: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Failover retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retry/backoff policy for one candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FailoverPolicy {
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "d_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "d_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            max_attempts: d_max_attempts(),
            base_backoff_ms: d_base_backoff_ms(),
            max_backoff_ms: d_max_backoff_ms(),
        }
    }
}

/// Failover settings with per-provider and per-model overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default: FailoverPolicy,
    #[serde(default)]
    pub provider_overrides: HashMap<String, FailoverPolicy>,
    #[serde(default)]
    pub model_overrides: HashMap<String, FailoverPolicy>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: FailoverPolicy::default(),
            provider_overrides: HashMap::new(),
            model_overrides: HashMap::new(),
        }
    }
}

impl FailoverConfig {
    /// Resolve the effective policy for a (provider, model) pair:
    /// default, then provider override, then model override. Lookups also
    /// try the lowercased key.
    pub fn policy_for(&self, provider: &str, model: &str) -> FailoverPolicy {
        let mut policy = self.default;

        let provider_hit = self
            .provider_overrides
            .get(provider)
            .or_else(|| self.provider_overrides.get(&provider.to_lowercase()));
        if let Some(p) = provider_hit {
            policy = *p;
        }

        let model_hit = self
            .model_overrides
            .get(model)
            .or_else(|| self.model_overrides.get(&model.to_lowercase()));
        if let Some(p) = model_hit {
            policy = *p;
        }

        policy.max_attempts = policy.max_attempts.max(1);
        policy.max_backoff_ms = policy.max_backoff_ms.max(1);
        policy
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_default_model() -> String {
    "anthropic/claude-opus-4-5".into()
}
fn d_max_attempts() -> u32 {
    2
}
fn d_base_backoff_ms() -> u64 {
    350
}
fn d_max_backoff_ms() -> u64 {
    5000
}
fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_resolution_order() {
        let mut config = FailoverConfig::default();
        config.provider_overrides.insert(
            "primary".into(),
            FailoverPolicy {
                max_attempts: 3,
                base_backoff_ms: 100,
                max_backoff_ms: 1000,
            },
        );
        config.model_overrides.insert(
            "slow-model".into(),
            FailoverPolicy {
                max_attempts: 5,
                base_backoff_ms: 500,
                max_backoff_ms: 9000,
            },
        );

        let base = config.policy_for("other", "any");
        assert_eq!(base.max_attempts, 2);

        let per_provider = config.policy_for("primary", "any");
        assert_eq!(per_provider.max_attempts, 3);

        // The model override wins over the provider override.
        let per_model = config.policy_for("primary", "slow-model");
        assert_eq!(per_model.max_attempts, 5);
        assert_eq!(per_model.max_backoff_ms, 9000);
    }

    #[test]
    fn policy_lookup_falls_back_to_lowercase() {
        let mut config = FailoverConfig::default();
        config.model_overrides.insert(
            "gpt-4o".into(),
            FailoverPolicy {
                max_attempts: 4,
                base_backoff_ms: 10,
                max_backoff_ms: 50,
            },
        );
        assert_eq!(config.policy_for("p", "GPT-4o").max_attempts, 4);
    }

    #[test]
    fn policy_floors_are_enforced() {
        let mut config = FailoverConfig::default();
        config.default = FailoverPolicy {
            max_attempts: 0,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        let policy = config.policy_for("p", "m");
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_backoff_ms, 1);
    }
}
