//! Agent tools: the [`Tool`] trait, the registry with schema validation and
//! approval gating, and the built-in tool set (shell with Docker sandbox,
//! structured patches, file operations, channel messages).

pub mod fs;
pub mod message;
pub mod patch;
pub mod registry;
pub mod sandbox;
pub mod schema;
pub mod shell;

use serde_json::Value;

pub use registry::{ApprovalGate, ToolAudit, ToolEventSink, ToolRegistry};
pub use sandbox::DockerSandbox;

/// Execution context the registry pushes to context-aware tools before each
/// dialog turn.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub user_key: String,
    pub run_id: String,
}

/// One agent tool. Execution never fails at the type level: problems are
/// returned as error strings so the model can read and react to them.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    async fn execute(&self, params: Value) -> String;

    /// Called by the registry before each turn with the current routing
    /// context. Most tools ignore it.
    fn set_registry_context(&self, _ctx: &ToolContext) {}
}

/// OpenAI-style function definition for a tool.
pub fn definition_for(tool: &dyn Tool) -> courier_domain::tool::ToolDefinition {
    courier_domain::tool::ToolDefinition {
        name: tool.name().to_owned(),
        description: tool.description().to_owned(),
        parameters: tool.parameters(),
    }
}
