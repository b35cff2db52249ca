//! Tool registry — validation, approval gating, sanitized events, audit.
//!
//! Execution order for one call: lookup → schema validation → approval
//! policy → `tool_start` event → execute → `tool_end` event → audit. Every
//! failure becomes an error string in the tool result so the model can
//! react; the registry itself never errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use courier_domain::config::{ApprovalMode, ToolApprovalConfig};
use courier_domain::event::{AgentEvent, EventPayload};
use courier_domain::sanitize::sanitize_value;

use crate::schema::validate_params;
use crate::{Tool, ToolContext};

const PARAMS_SANITIZE_LEN: usize = 500;
const RESULT_SANITIZE_LEN: usize = 1200;

/// Asks the user to approve a gated tool call; resolves to true on approval.
#[async_trait::async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        params: Value,
        timeout: Duration,
    ) -> bool;
}

/// Receives sanitized tool lifecycle events for the run stream.
#[async_trait::async_trait]
pub trait ToolEventSink: Send + Sync {
    async fn emit(&self, event: AgentEvent);
}

/// Receives sanitized execution records for the audit trail.
pub trait ToolAudit: Send + Sync {
    fn log_tool(&self, tool_name: &str, params: &Value, result: &str, duration_ms: f64, ok: bool);
}

pub struct ToolRegistry {
    tools: Mutex<Vec<Arc<dyn Tool>>>,
    approval_config: ToolApprovalConfig,
    approval_timeout: Duration,
    approval_gate: Mutex<Option<Arc<dyn ApprovalGate>>>,
    event_sink: Mutex<Option<Arc<dyn ToolEventSink>>>,
    audit: Mutex<Option<Arc<dyn ToolAudit>>>,
    context: Mutex<ToolContext>,
}

impl ToolRegistry {
    pub fn new(approval_config: ToolApprovalConfig, approval_timeout: Duration) -> Self {
        Self {
            tools: Mutex::new(Vec::new()),
            approval_config,
            approval_timeout,
            approval_gate: Mutex::new(None),
            event_sink: Mutex::new(None),
            audit: Mutex::new(None),
            context: Mutex::new(ToolContext::default()),
        }
    }

    pub fn set_approval_gate(&self, gate: Arc<dyn ApprovalGate>) {
        *self.approval_gate.lock() = Some(gate);
    }

    pub fn set_event_sink(&self, sink: Arc<dyn ToolEventSink>) {
        *self.event_sink.lock() = Some(sink);
    }

    pub fn set_audit(&self, audit: Arc<dyn ToolAudit>) {
        *self.audit.lock() = Some(audit);
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.lock();
        tools.retain(|t| t.name() != tool.name());
        tools.push(tool);
    }

    pub fn unregister(&self, name: &str) {
        self.tools.lock().retain(|t| t.name() != name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.lock().iter().find(|t| t.name() == name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.lock().iter().map(|t| t.name().to_owned()).collect()
    }

    /// Tool definitions in registration order, for the LLM request.
    pub fn definitions(&self) -> Vec<courier_domain::tool::ToolDefinition> {
        self.tools
            .lock()
            .iter()
            .map(|t| crate::definition_for(t.as_ref()))
            .collect()
    }

    /// Push the current routing context to every context-aware tool.
    pub fn set_context(&self, ctx: ToolContext) {
        for tool in self.tools.lock().iter() {
            tool.set_registry_context(&ctx);
        }
        *self.context.lock() = ctx;
    }

    pub fn context(&self) -> ToolContext {
        self.context.lock().clone()
    }

    /// Execute a tool by name. The returned string is either the tool output
    /// or a descriptive error the model can act on.
    pub async fn execute(&self, name: &str, params: Value) -> String {
        let tool = match self.get(name) {
            Some(tool) => tool,
            None => return format!("Error: Tool '{name}' not found"),
        };

        let errors = validate_params(&params, &tool.parameters());
        if !errors.is_empty() {
            return format!(
                "Error: Invalid parameters for tool '{name}': {}",
                errors.join("; ")
            );
        }

        match self.approval_config.mode_for(name) {
            ApprovalMode::AlwaysDeny => {
                return format!("Error: Tool '{name}' is not allowed by policy");
            }
            ApprovalMode::AlwaysAsk => {
                if !self.request_approval(name, &params).await {
                    return format!("Error: Tool '{name}' denied or approval timed out");
                }
            }
            ApprovalMode::AlwaysAllow => {}
        }

        let sanitized_params = sanitize_value(&params, PARAMS_SANITIZE_LEN);
        self.emit(EventPayload::ToolStart {
            tool_name: name.to_owned(),
            params: sanitized_params.clone(),
        })
        .await;

        let start = Instant::now();
        let result = tool.execute(params).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let ok = !result.starts_with("Error");
        let sanitized_result = sanitize_value(&Value::String(result.clone()), RESULT_SANITIZE_LEN);

        self.emit(EventPayload::ToolEnd {
            tool_name: name.to_owned(),
            params: sanitized_params.clone(),
            ok,
            result: sanitized_result.clone(),
            duration_ms,
            blocked_by_hook: false,
            rate_limited: false,
        })
        .await;

        let audit = self.audit.lock().clone();
        if let Some(audit) = audit {
            let result_str = sanitized_result.as_str().unwrap_or_default();
            audit.log_tool(name, &sanitized_params, result_str, duration_ms, ok);
        }

        result
    }

    async fn request_approval(&self, name: &str, params: &Value) -> bool {
        let gate = self.approval_gate.lock().clone();
        let gate = match gate {
            Some(gate) => gate,
            // No gate wired: fail closed.
            None => return false,
        };
        let ctx = self.context();
        gate.request_approval(
            &ctx,
            name,
            sanitize_value(params, PARAMS_SANITIZE_LEN),
            self.approval_timeout,
        )
        .await
    }

    async fn emit(&self, payload: EventPayload) {
        let sink = self.event_sink.lock().clone();
        if let Some(sink) = sink {
            let ctx = self.context();
            let event = AgentEvent::new(payload, ctx.run_id.clone(), ctx.session_key.clone())
                .with_route(ctx.channel.clone(), ctx.chat_id.clone());
            sink.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_domain::config::ApprovalProfile;
    use serde_json::json;

    struct SampleTool;

    #[async_trait::async_trait]
    impl Tool for SampleTool {
        fn name(&self) -> &str {
            "sample"
        }
        fn description(&self) -> &str {
            "sample tool"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "minLength": 2},
                    "count": {"type": "integer", "minimum": 1, "maximum": 10},
                },
                "required": ["query", "count"],
            })
        }
        async fn execute(&self, _params: Value) -> String {
            "ok".into()
        }
    }

    struct PatchLikeTool;

    #[async_trait::async_trait]
    impl Tool for PatchLikeTool {
        fn name(&self) -> &str {
            "apply_patch"
        }
        fn description(&self) -> &str {
            "patch tool"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"patch": {"type": "string"}},
                "required": ["patch"],
            })
        }
        async fn execute(&self, _params: Value) -> String {
            "patched".into()
        }
    }

    struct DenyAllGate;

    #[async_trait::async_trait]
    impl ApprovalGate for DenyAllGate {
        async fn request_approval(
            &self,
            _ctx: &ToolContext,
            _tool_name: &str,
            _params: Value,
            _timeout: Duration,
        ) -> bool {
            false
        }
    }

    struct CaptureSink {
        events: Mutex<Vec<AgentEvent>>,
    }

    #[async_trait::async_trait]
    impl ToolEventSink for CaptureSink {
        async fn emit(&self, event: AgentEvent) {
            self.events.lock().push(event);
        }
    }

    fn registry(config: ToolApprovalConfig) -> ToolRegistry {
        ToolRegistry::new(config, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn missing_tool_is_an_error_string() {
        let reg = registry(ToolApprovalConfig::default());
        let result = reg.execute("ghost", json!({})).await;
        assert_eq!(result, "Error: Tool 'ghost' not found");
    }

    #[tokio::test]
    async fn validation_failure_is_reported() {
        let reg = registry(ToolApprovalConfig::default());
        reg.register(Arc::new(SampleTool));
        let result = reg.execute("sample", json!({"query": "hi"})).await;
        assert!(result.contains("Invalid parameters"));
        assert!(result.contains("missing required count"));
    }

    #[tokio::test]
    async fn unclassified_tool_defaults_to_allow() {
        // Everything in the table is always_ask, but "sample" is not a
        // classified tool name, so it runs without approval.
        let mut config = ToolApprovalConfig::default();
        config.web_fetch = ApprovalMode::AlwaysAsk;
        let reg = registry(config);
        reg.register(Arc::new(SampleTool));
        let result = reg.execute("sample", json!({"query": "hello", "count": 2})).await;
        assert_eq!(result, "ok");
    }

    #[tokio::test]
    async fn apply_patch_uses_write_file_approval_mode() {
        let config = ToolApprovalConfig::from_profile(ApprovalProfile::Automation);
        // automation: write_file = always_ask, and no gate is wired → deny.
        let reg = registry(config);
        reg.register(Arc::new(PatchLikeTool));
        let result = reg
            .execute("apply_patch", json!({"patch": "*** Begin Patch\n*** End Patch"}))
            .await;
        assert!(result.contains("denied"));
    }

    #[tokio::test]
    async fn always_deny_blocks() {
        let config = ToolApprovalConfig::from_profile(ApprovalProfile::LockedDown);
        let reg = registry(config);
        reg.register(Arc::new(PatchLikeTool));
        let result = reg.execute("apply_patch", json!({"patch": "x"})).await;
        assert!(result.contains("not allowed by policy"));
    }

    #[tokio::test]
    async fn explicit_denial_from_gate() {
        let mut config = ToolApprovalConfig::default();
        config.write_file = ApprovalMode::AlwaysAsk;
        let reg = registry(config);
        reg.set_approval_gate(Arc::new(DenyAllGate));
        reg.register(Arc::new(PatchLikeTool));
        let result = reg.execute("apply_patch", json!({"patch": "x"})).await;
        assert!(result.contains("denied or approval timed out"));
    }

    #[tokio::test]
    async fn tool_events_are_sanitized() {
        let reg = registry(ToolApprovalConfig::default());
        let sink = Arc::new(CaptureSink {
            events: Mutex::new(Vec::new()),
        });
        reg.set_event_sink(sink.clone());
        reg.register(Arc::new(SampleTool));
        reg.set_context(ToolContext {
            channel: "cli".into(),
            chat_id: "direct".into(),
            session_key: "cli:direct".into(),
            user_key: "user".into(),
            run_id: "run123".into(),
        });

        reg.execute(
            "sample",
            json!({"query": "hello", "count": 2, "api_key": "sk-secret-123"}),
        )
        .await;

        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload.type_name(), "tool_start");
        assert_eq!(events[1].payload.type_name(), "tool_end");
        assert_eq!(events[0].run_id, "run123");
        let json = serde_json::to_string(&events[0]).unwrap();
        assert!(!json.contains("sk-secret-123"));
    }

    #[tokio::test]
    async fn register_replaces_same_name() {
        let reg = registry(ToolApprovalConfig::default());
        reg.register(Arc::new(SampleTool));
        reg.register(Arc::new(SampleTool));
        assert_eq!(reg.tool_names(), vec!["sample"]);
    }
}
