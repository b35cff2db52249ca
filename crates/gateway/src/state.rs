//! Shared construction context for the agent loop.
//!
//! There are no process-wide singletons: everything the runtime needs is
//! passed in as a handle through [`AgentDeps`].

use std::path::PathBuf;
use std::sync::Arc;

use courier_domain::config::Config;
use courier_providers::LlmProvider;

use crate::audit::AuditLogger;
use crate::bus::MessageBus;
use crate::ratelimit::RateLimiter;
use crate::usage::UsageTracker;

/// Everything the agent loop is built from.
pub struct AgentDeps {
    pub config: Config,
    /// The agent's working directory (bootstrap files, memory, skills).
    pub workspace: PathBuf,
    /// Global data directory (sessions, runs, audit, secrets).
    pub data_dir: PathBuf,
    pub bus: Arc<MessageBus>,
    pub provider: Arc<dyn LlmProvider>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub audit: Option<Arc<AuditLogger>>,
    pub usage: Option<Arc<UsageTracker>>,
}

/// Default data directory: `~/.courier`.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
}
