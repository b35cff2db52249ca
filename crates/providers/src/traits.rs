use serde::{Deserialize, Serialize};

use courier_domain::config::ThinkingMode;
use courier_domain::error::Result;
use courier_domain::stream::{BoxStream, Usage};
use courier_domain::tool::{ChatMessage, ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke; empty disables tools.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier. Empty means the provider's default.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Reasoning-effort override, when the session requests one.
    pub thinking: Option<ThinkingMode>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            model: String::new(),
            max_tokens: 4096,
            temperature: 0.7,
            thinking: None,
        }
    }
}

/// How the model stopped generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Length,
    /// Upstream capacity failure; triggers compaction retry and failover.
    Overloaded,
    Error,
}

impl FinishReason {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "length" | "max_tokens" => Self::Length,
            "overloaded" => Self::Overloaded,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }
}

/// A provider response: text and/or tool calls.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Synthesize the error-as-response shape the failover layer retries on.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: format!("Error calling LLM: {message}"),
            finish_reason: FinishReason::Error,
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Retryable responses: error/overloaded finishes or the error-content
    /// marker, regardless of finish reason.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.finish_reason,
            FinishReason::Error | FinishReason::Overloaded
        ) || self.content.trim_start().starts_with("Error calling LLM:")
    }
}

/// Streaming event: incremental text deltas, then exactly one final response.
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    Delta { text: String },
    Final { response: LlmResponse },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// Implementations translate between the internal message model and a
/// provider's wire format. Transport errors may be returned as `Err` or
/// folded into an [`LlmResponse::error`]; the failover layer treats both as
/// retryable.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<LlmResponse>;

    /// Stream a chat completion as delta events followed by one final event.
    /// The default falls back to non-streaming.
    async fn stream_chat(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, LlmStreamEvent>> {
        let response = self.chat(req).await?;
        Ok(Box::pin(futures_util::stream::once(async move {
            LlmStreamEvent::Final { response }
        })))
    }

    /// Generate text embeddings. Providers without an embeddings endpoint
    /// keep the default error.
    async fn embed(&self, _texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>> {
        Err(courier_domain::Error::Provider {
            provider: self.name().to_owned(),
            message: "embeddings not supported".into(),
        })
    }

    /// Whether [`stream_chat`](Self::stream_chat) produces true deltas.
    fn supports_streaming(&self) -> bool {
        false
    }

    fn default_model(&self) -> &str;

    fn name(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model-name normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Prefix bare model names with their provider family so routed gateways
/// accept them: `claude-*` → `anthropic/`, `gemini-*` → `gemini/`,
/// `gpt-*`/`o1*`/`o3*` → `openai/`. Names that already carry a `/` prefix
/// pass through unchanged.
pub fn normalize_model_name(model: &str) -> String {
    let trimmed = model.trim();
    if trimmed.is_empty() || trimmed.contains('/') {
        return trimmed.to_owned();
    }
    let lower = trimmed.to_ascii_lowercase();
    let prefix = if lower.contains("claude") {
        "anthropic"
    } else if lower.contains("gemini") {
        "gemini"
    } else if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
        "openai"
    } else {
        return trimmed.to_owned();
    };
    format!("{prefix}/{trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_detection() {
        assert!(LlmResponse {
            finish_reason: FinishReason::Overloaded,
            ..Default::default()
        }
        .is_retryable());
        assert!(LlmResponse::error("boom").is_retryable());
        assert!(LlmResponse::text("Error calling LLM: upstream 503").is_retryable());
        assert!(!LlmResponse::text("fine").is_retryable());
    }

    #[test]
    fn finish_reason_from_wire() {
        assert_eq!(FinishReason::from_wire("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("OVERLOADED"), FinishReason::Overloaded);
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("weird"), FinishReason::Stop);
    }

    #[test]
    fn model_normalization_adds_family_prefix() {
        assert_eq!(
            normalize_model_name("claude-opus-4-5"),
            "anthropic/claude-opus-4-5"
        );
        assert_eq!(normalize_model_name("gemini-2.0-flash"), "gemini/gemini-2.0-flash");
        assert_eq!(normalize_model_name("gpt-4o"), "openai/gpt-4o");
        assert_eq!(normalize_model_name("o3-mini"), "openai/o3-mini");
    }

    #[test]
    fn model_normalization_keeps_prefixed_and_unknown() {
        assert_eq!(
            normalize_model_name("anthropic/claude-opus-4-5"),
            "anthropic/claude-opus-4-5"
        );
        assert_eq!(normalize_model_name("llama3:8b"), "llama3:8b");
        assert_eq!(normalize_model_name("  gpt-4o  "), "openai/gpt-4o");
    }
}
