//! LLM provider abstraction: the [`LlmProvider`] trait, an OpenAI-compatible
//! HTTP adapter with SSE streaming, the cross-provider failover wrapper, and
//! a scripted mock for tests.

pub mod failover;
pub mod mock;
pub mod openai_compat;
mod sse;
pub mod traits;

pub use failover::{FailoverCandidate, FailoverProvider};
pub use mock::ScriptedProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use traits::{
    normalize_model_name, ChatRequest, FinishReason, LlmProvider, LlmResponse, LlmStreamEvent,
};
