//! OpenAI-compatible chat adapter.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, LM Studio, and any other
//! endpoint following the chat completions contract. Streaming uses SSE with
//! the `[DONE]` sentinel and `stream_options.include_usage` usage chunks.

use std::collections::HashMap;

use serde_json::Value;

use courier_domain::config::ThinkingMode;
use courier_domain::error::{Error, Result};
use courier_domain::stream::{BoxStream, Usage};
use courier_domain::tool::{ChatMessage, MessageContent, Role, ToolCall, ToolDefinition};

use crate::sse::drain_data_lines;
use crate::traits::{ChatRequest, FinishReason, LlmProvider, LlmResponse, LlmStreamEvent};

pub struct OpenAiCompatProvider {
    name: String,
    api_base: String,
    api_key: String,
    default_model: String,
    extra_headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            extra_headers: HashMap::new(),
            client,
        })
    }

    pub fn with_extra_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.extra_headers = headers;
        self
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        for (key, value) in &self.extra_headers {
            builder = builder.header(key, value);
        }
        builder
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        let model = if req.model.is_empty() {
            self.default_model.as_str()
        } else {
            req.model.as_str()
        };
        crate::traits::normalize_model_name(model)
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(thinking) = req.thinking {
            if thinking != ThinkingMode::Off {
                body["reasoning_effort"] = Value::String(thinking.as_str().into());
            }
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }

    /// Map capacity-style failures to an overloaded response so the dialog
    /// loop can compact-and-retry; other HTTP failures stay hard errors.
    fn classify_http_failure(&self, status: u16, body: &str) -> Result<LlmResponse> {
        if matches!(status, 429 | 500 | 502 | 503 | 504 | 529) {
            return Ok(LlmResponse {
                content: format!("Error calling LLM: HTTP {status}"),
                finish_reason: FinishReason::Overloaded,
                ..Default::default()
            });
        }
        Err(Error::Provider {
            provider: self.name.clone(),
            message: format!("HTTP {status} - {body}"),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &ChatMessage) -> Value {
    let mut obj = serde_json::json!({"role": role_str(msg.role)});

    obj["content"] = match &msg.content {
        MessageContent::Text(t) => Value::String(t.clone()),
        MessageContent::Parts(parts) => serde_json::to_value(parts).unwrap_or(Value::Null),
    };

    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    if let Some(call_id) = &msg.tool_call_id {
        obj["tool_call_id"] = Value::String(call_id.clone());
    }
    if let Some(name) = &msg.name {
        obj["name"] = Value::String(name.clone());
    }
    obj
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_usage(value: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: value.get("prompt_tokens")?.as_u64()?,
        completion_tokens: value.get("completion_tokens")?.as_u64()?,
        total_tokens: value.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_owned();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_owned();
            let args_str = func.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

fn parse_chat_response(name: &str, body: &Value) -> Result<LlmResponse> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: name.to_owned(),
            message: "no choices in response".into(),
        })?;
    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: name.to_owned(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::from_wire)
        .unwrap_or_default();
    let tool_calls = parse_tool_calls(message);
    let usage = body.get("usage").and_then(parse_usage).unwrap_or_default();

    Ok(LlmResponse {
        content,
        tool_calls,
        finish_reason,
        usage,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StreamAssembly {
    text: String,
    // index → (call_id, name, argument json fragments)
    tool_calls: Vec<(String, String, String)>,
    usage: Usage,
    finish_reason: Option<FinishReason>,
}

impl StreamAssembly {
    /// Apply one SSE data payload; returns text delta to forward, if any.
    fn apply(&mut self, data: &str) -> Option<String> {
        let value: Value = serde_json::from_str(data).ok()?;

        if let Some(usage) = value.get("usage").and_then(parse_usage) {
            self.usage = usage;
        }

        let choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|a| a.first())?;

        if let Some(fr) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(FinishReason::from_wire(fr));
        }

        let delta = choice.get("delta")?;

        if let Some(tc_arr) = delta.get("tool_calls").and_then(Value::as_array) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls
                        .push((String::new(), String::new(), String::new()));
                }
                let slot = &mut self.tool_calls[index];
                if let Some(id) = tc.get("id").and_then(Value::as_str) {
                    slot.0 = id.to_owned();
                }
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                {
                    slot.1.push_str(name);
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                {
                    slot.2.push_str(args);
                }
            }
            return None;
        }

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.text.push_str(text);
        Some(text.to_owned())
    }

    fn into_response(self) -> LlmResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .filter(|(id, name, _)| !id.is_empty() || !name.is_empty())
            .map(|(id, name, args)| ToolCall {
                id,
                name,
                arguments: serde_json::from_str(&args)
                    .unwrap_or(Value::Object(Default::default())),
            })
            .collect();
        let finish_reason = match self.finish_reason {
            Some(fr) => fr,
            None if !tool_calls.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };
        LlmResponse {
            content: self.text,
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_chat_body(req, false);
        tracing::debug!(provider = %self.name, url = %url, "chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return self.classify_http_failure(status.as_u16(), &text);
        }
        let json: Value = serde_json::from_str(&text)?;
        parse_chat_response(&self.name, &json)
    }

    async fn stream_chat(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, LlmStreamEvent>> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_chat_body(req, true);
        tracing::debug!(provider = %self.name, url = %url, "stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Http(e.to_string()))?;
            let response = self.classify_http_failure(status.as_u16(), &text)?;
            return Ok(Box::pin(futures_util::stream::once(async move {
                LlmStreamEvent::Final { response }
            })));
        }

        let stream = async_stream::stream! {
            let mut resp = resp;
            let mut buffer = String::new();
            let mut assembly = StreamAssembly::default();
            let mut finished = false;

            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for data in drain_data_lines(&mut buffer) {
                            if data.trim() == "[DONE]" {
                                finished = true;
                                continue;
                            }
                            if let Some(delta) = assembly.apply(&data) {
                                yield LlmStreamEvent::Delta { text: delta };
                            }
                        }
                        if finished {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield LlmStreamEvent::Final {
                            response: LlmResponse::error(e),
                        };
                        return;
                    }
                }
            }

            yield LlmStreamEvent::Final {
                response: assembly.into_response(),
            };
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base);
        let body = serde_json::json!({"model": model, "input": texts});

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.name.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        let data = json
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Provider {
                provider: self.name.clone(),
                message: "missing 'data' array in embeddings response".into(),
            })?;
        Ok(data
            .iter()
            .filter_map(|item| {
                let embedding = item.get("embedding")?.as_array()?;
                Some(
                    embedding
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect(),
                )
            })
            .collect())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_serialize_openai_shape() {
        let msg = ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "tc_1".into(),
                name: "exec".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        );
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "exec");
        // Arguments are a JSON-encoded string on the wire.
        let args = wire["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(args).unwrap()["command"],
            "ls"
        );
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let msg = ChatMessage::tool_result("tc_1", "exec", "output");
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "tc_1");
        assert_eq!(wire["content"], "output");
    }

    #[test]
    fn parse_response_with_tool_calls() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "function": {"name": "exec", "arguments": "{\"command\":\"pwd\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        let resp = parse_chat_response("test", &body).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "exec");
        assert_eq!(resp.usage.total_tokens, 15);
    }

    #[test]
    fn stream_assembly_gathers_text_and_tools() {
        let mut assembly = StreamAssembly::default();
        assert_eq!(
            assembly.apply(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            Some("Hel".into())
        );
        assert_eq!(
            assembly.apply(r#"{"choices":[{"delta":{"content":"lo"}}]}"#),
            Some("lo".into())
        );
        assert!(assembly
            .apply(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"exec","arguments":"{\"co"}}]}}]}"#
            )
            .is_none());
        assert!(assembly
            .apply(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"mmand\":\"ls\"}"}}]}}]}"#
            )
            .is_none());
        assembly.apply(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);

        let resp = assembly.into_response();
        assert_eq!(resp.content, "Hello");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn usage_only_chunk_recorded() {
        let mut assembly = StreamAssembly::default();
        assert!(assembly
            .apply(r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2,"total_tokens":9}}"#)
            .is_none());
        assert_eq!(assembly.into_response().usage.total_tokens, 9);
    }
}
