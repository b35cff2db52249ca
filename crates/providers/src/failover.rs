//! Cross-provider failover with retry and backoff.
//!
//! Wraps an ordered list of candidates. An attempt is retried when the
//! response is retryable (error/overloaded finish, or the
//! `"Error calling LLM:"` content marker). Streaming commits to a candidate
//! once any delta has reached the consumer; no failover happens after that
//! point, so the user never sees doubled output.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use courier_domain::config::FailoverConfig;
use courier_domain::error::Result;
use courier_domain::stream::BoxStream;

use crate::traits::{ChatRequest, LlmProvider, LlmResponse, LlmStreamEvent};

/// One resolved provider candidate.
#[derive(Clone)]
pub struct FailoverCandidate {
    pub name: String,
    pub provider: Arc<dyn LlmProvider>,
}

pub struct FailoverProvider {
    candidates: Vec<FailoverCandidate>,
    default_model: String,
    config: FailoverConfig,
}

impl FailoverProvider {
    pub fn new(
        candidates: Vec<FailoverCandidate>,
        default_model: impl Into<String>,
        config: FailoverConfig,
    ) -> Self {
        assert!(
            !candidates.is_empty(),
            "failover requires at least one provider candidate"
        );
        Self {
            candidates,
            default_model: default_model.into(),
            config,
        }
    }

    fn chosen_model(&self, req: &ChatRequest) -> String {
        if req.model.is_empty() {
            self.default_model.clone()
        } else {
            req.model.clone()
        }
    }

    fn backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let raw = max_ms.min(base_ms.saturating_mul(1u64 << attempt.min(20)));
        let jitter = (raw.max(1) as f64 * 0.2 * fastrand::f64()) as u64;
        Duration::from_millis(raw + jitter)
    }
}

#[async_trait::async_trait]
impl LlmProvider for FailoverProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let model = self.chosen_model(req);
        let mut request = req.clone();
        request.model = model.clone();

        let mut fallback: Option<LlmResponse> = None;

        for candidate in &self.candidates {
            let policy = self.config.policy_for(&candidate.name, &model);
            for attempt in 0..policy.max_attempts {
                let response = match candidate.provider.chat(&request).await {
                    Ok(response) => response,
                    Err(e) => LlmResponse::error(e),
                };
                if !response.is_retryable() {
                    return Ok(response);
                }
                tracing::warn!(
                    candidate = %candidate.name,
                    model = %model,
                    attempt,
                    "retryable provider response"
                );
                fallback = Some(response);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(Self::backoff(
                        policy.base_backoff_ms,
                        policy.max_backoff_ms,
                        attempt,
                    ))
                    .await;
                }
            }
        }

        Ok(fallback
            .unwrap_or_else(|| LlmResponse::error("failover candidates exhausted")))
    }

    async fn stream_chat(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, LlmStreamEvent>> {
        let model = self.chosen_model(req);
        let mut request = req.clone();
        request.model = model.clone();

        let candidates = self.candidates.clone();
        let config = self.config.clone();

        let stream = async_stream::stream! {
            let mut fallback: Option<LlmResponse> = None;

            for candidate in &candidates {
                let policy = config.policy_for(&candidate.name, &model);
                for attempt in 0..policy.max_attempts {
                    let mut had_delta = false;
                    let mut final_response: Option<LlmResponse> = None;

                    match candidate.provider.stream_chat(&request).await {
                        Ok(mut inner) => {
                            while let Some(event) = inner.next().await {
                                match event {
                                    LlmStreamEvent::Delta { text } => {
                                        if !text.is_empty() {
                                            had_delta = true;
                                            yield LlmStreamEvent::Delta { text };
                                        }
                                    }
                                    LlmStreamEvent::Final { response } => {
                                        final_response = Some(response);
                                    }
                                }
                            }
                            if final_response.is_none() {
                                // No final event; fall back to a plain call.
                                final_response = Some(
                                    match candidate.provider.chat(&request).await {
                                        Ok(response) => response,
                                        Err(e) => LlmResponse::error(e),
                                    },
                                );
                            }
                        }
                        Err(e) => {
                            final_response = Some(LlmResponse::error(e));
                        }
                    }

                    let response = match final_response {
                        Some(response) => response,
                        None => continue,
                    };
                    let retryable = response.is_retryable();
                    fallback = Some(response.clone());

                    // Once output has been yielded, the attempt is committed:
                    // failing over now would replay content.
                    if !retryable || had_delta {
                        yield LlmStreamEvent::Final { response };
                        return;
                    }
                    if attempt + 1 < policy.max_attempts {
                        tokio::time::sleep(Self::backoff(
                            policy.base_backoff_ms,
                            policy.max_backoff_ms,
                            attempt,
                        ))
                        .await;
                    }
                }
            }

            yield LlmStreamEvent::Final {
                response: fallback
                    .unwrap_or_else(|| LlmResponse::error("failover candidates exhausted")),
            };
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;
        for candidate in &self.candidates {
            let policy = self.config.policy_for(&candidate.name, model);
            for attempt in 0..policy.max_attempts {
                match candidate.provider.embed(texts, model).await {
                    Ok(embeddings) => return Ok(embeddings),
                    Err(e) => {
                        last_error = Some(e);
                        if attempt + 1 < policy.max_attempts {
                            tokio::time::sleep(Self::backoff(
                                policy.base_backoff_ms,
                                policy.max_backoff_ms,
                                attempt,
                            ))
                            .await;
                        }
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| courier_domain::Error::Provider {
            provider: "failover".into(),
            message: "no provider candidates available for embeddings".into(),
        }))
    }

    fn supports_streaming(&self) -> bool {
        self.candidates
            .iter()
            .any(|c| c.provider.supports_streaming())
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn name(&self) -> &str {
        "failover"
    }
}
