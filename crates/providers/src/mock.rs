//! Scripted provider for tests and dry runs.
//!
//! Replies are consumed in order; each can carry a delay, streamed deltas,
//! and a final response. Requests are captured so tests can assert on the
//! exact message lists the loop sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use courier_domain::error::Result;
use courier_domain::stream::BoxStream;
use courier_domain::tool::ToolCall;

use crate::traits::{ChatRequest, FinishReason, LlmProvider, LlmResponse, LlmStreamEvent};

/// One scripted provider turn.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub delay: Duration,
    /// Deltas yielded before the final response when streaming.
    pub deltas: Vec<String>,
    pub response: LlmResponse,
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            deltas: Vec::new(),
            response: LlmResponse::text(content),
        }
    }

    pub fn overloaded() -> Self {
        Self {
            delay: Duration::ZERO,
            deltas: Vec::new(),
            response: LlmResponse {
                finish_reason: FinishReason::Overloaded,
                ..Default::default()
            },
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            delay: Duration::ZERO,
            deltas: Vec::new(),
            response: LlmResponse {
                tool_calls: vec![ToolCall {
                    id: id.into(),
                    name: name.into(),
                    arguments,
                }],
                finish_reason: FinishReason::ToolCalls,
                ..Default::default()
            },
        }
    }

    /// A streamed reply: `delta_text` is yielded as one delta, then the
    /// final response of `final_reply`.
    pub fn streamed(delta_text: impl Into<String>, final_reply: ScriptedReply) -> Self {
        Self {
            delay: final_reply.delay,
            deltas: vec![delta_text.into()],
            response: final_reply.response,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.response.usage = courier_domain::stream::Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        };
        self
    }
}

pub struct ScriptedProvider {
    name: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: LlmResponse,
    calls: Arc<AtomicUsize>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(VecDeque::new()),
            fallback: LlmResponse::text("done"),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_replies(self, replies: Vec<ScriptedReply>) -> Self {
        *self.replies.lock() = replies.into();
        self
    }

    /// Response returned once the script is exhausted.
    pub fn with_fallback(mut self, fallback: LlmResponse) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_count_handle(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    async fn next_reply(&self, req: &ChatRequest) -> ScriptedReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req.clone());
        let reply = self.replies.lock().pop_front().unwrap_or(ScriptedReply {
            delay: Duration::ZERO,
            deltas: Vec::new(),
            response: self.fallback.clone(),
        });
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        Ok(self.next_reply(req).await.response)
    }

    async fn stream_chat(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, LlmStreamEvent>> {
        let reply = self.next_reply(req).await;
        let stream = async_stream::stream! {
            for delta in reply.deltas {
                yield LlmStreamEvent::Delta { text: delta };
            }
            yield LlmStreamEvent::Final {
                response: reply.response,
            };
        };
        Ok(Box::pin(stream))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn replies_consumed_in_order_then_fallback() {
        let provider = ScriptedProvider::new("mock").with_replies(vec![
            ScriptedReply::text("one"),
            ScriptedReply::text("two"),
        ]);
        let req = ChatRequest::new(vec![]);
        assert_eq!(provider.chat(&req).await.unwrap().content, "one");
        assert_eq!(provider.chat(&req).await.unwrap().content, "two");
        assert_eq!(provider.chat(&req).await.unwrap().content, "done");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn streamed_reply_yields_deltas_then_final() {
        let provider = ScriptedProvider::new("mock").with_replies(vec![
            ScriptedReply::streamed("hel", ScriptedReply::text("hello")),
        ]);
        let mut stream = provider.stream_chat(&ChatRequest::new(vec![])).await.unwrap();

        match stream.next().await.unwrap() {
            LlmStreamEvent::Delta { text } => assert_eq!(text, "hel"),
            other => panic!("expected delta, got {other:?}"),
        }
        match stream.next().await.unwrap() {
            LlmStreamEvent::Final { response } => assert_eq!(response.content, "hello"),
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_are_captured() {
        let provider = ScriptedProvider::new("mock");
        let mut req = ChatRequest::new(vec![]);
        req.model = "special".into();
        provider.chat(&req).await.unwrap();
        assert_eq!(provider.requests()[0].model, "special");
    }
}
