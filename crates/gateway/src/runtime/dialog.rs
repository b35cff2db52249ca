//! The dialog loop — one conversational turn.
//!
//! Builds the prompt context, calls the provider (streaming when possible),
//! dispatches tool calls through the registry with hook and rate-limit
//! gates, retries once through compaction on overload, and shapes or
//! suppresses the final reply.

use std::sync::OnceLock;

use futures_util::StreamExt;
use regex::Regex;
use serde_json::Value;

use courier_domain::config::ThinkingMode;
use courier_domain::error::{Error, Result};
use courier_domain::event::{AgentEvent, EventPayload};
use courier_domain::stream::Usage;
use courier_domain::tool::{ChatMessage, ToolCall};
use courier_providers::{ChatRequest, FinishReason, LlmResponse, LlmStreamEvent};
use courier_sessions::Session;

use crate::hooks::HookEvent;
use crate::runtime::compact::{apply_summary, generate_summary};
use crate::runtime::preview;
use crate::runtime::scheduler::{tool_context_for, AgentLoop};

const DELTA_CHUNK_SIZE: usize = 220;
const HISTORY_COMPACT_THRESHOLD: usize = 40;
const HISTORY_WINDOW: usize = 50;
const FALLBACK_REPLY: &str = "Completed; no user-visible output.";
const VISIBLE_REPLY_NUDGE: &str = "[system: please provide a user-visible reply.]";
const FORCED_SUMMARY_NUDGE: &str = "[system: please provide a user-visible reply. \
                                    If nothing else should be shown, state what was completed.]";

pub(crate) struct DialogOutcome {
    pub final_content: Option<String>,
    pub usage: Usage,
}

impl AgentLoop {
    /// Run one LLM + tool-call turn sequence and shape the final reply.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_dialog(
        &self,
        session: &mut Session,
        content: &str,
        channel: &str,
        chat_id: &str,
        sender_id: &str,
        media: &[String],
        run_id: &str,
        thinking_override: Option<ThinkingMode>,
        max_iterations: Option<usize>,
        model_override: Option<&str>,
    ) -> Result<DialogOutcome> {
        let active_model = model_override.unwrap_or(&self.inner.model).to_owned();

        if session.messages.len() > HISTORY_COMPACT_THRESHOLD {
            self.compact_session(session, run_id, "history_limit").await;
        }

        self.inner.tools.set_context(tool_context_for(
            channel,
            chat_id,
            sender_id,
            run_id,
            &session.key,
        ));

        let build_messages = |session: &Session| {
            self.inner.context.build_messages(
                &session.history(HISTORY_WINDOW),
                content,
                media,
                channel,
                chat_id,
            )
        };
        let mut messages = build_messages(session);

        let mut final_content: Option<String> = None;
        let mut suppressed = false;
        let mut asked_visible_reply = false;
        let mut usage_totals = Usage::default();
        let mut delta_index = 0usize;

        let max_iters = max_iterations.unwrap_or(self.inner.agent.max_iterations);
        let mut iteration = 0;
        while iteration < max_iters {
            self.check_cancelled(run_id)?;
            iteration += 1;

            self.inject_steer_updates(run_id, &session.key, channel, chat_id, &mut messages);

            let (response, streamed) = self
                .chat_with_optional_stream(
                    &messages,
                    true,
                    &active_model,
                    thinking_override,
                    run_id,
                    &session.key,
                    channel,
                    chat_id,
                    &mut delta_index,
                )
                .await?;
            usage_totals.merge(&response.usage);

            if response.finish_reason == FinishReason::Overloaded {
                tracing::warn!(run_id, "model overloaded, compacting and retrying");
                if self
                    .compact_session(session, run_id, "overloaded_retry")
                    .await
                {
                    messages = build_messages(session);
                    asked_visible_reply = false;
                    continue;
                }
                return Err(Error::Other(
                    "Model overloaded and compaction failed".into(),
                ));
            }

            if !streamed && !response.content.trim().is_empty() {
                self.emit_assistant_deltas(
                    run_id,
                    &session.key,
                    channel,
                    chat_id,
                    &response.content,
                    &mut delta_index,
                );
            }

            if response.has_tool_calls() {
                messages.push(ChatMessage::assistant_with_tools(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
                for tool_call in &response.tool_calls {
                    let result = self
                        .execute_tool_call(tool_call, run_id, &session.key, channel, chat_id, sender_id)
                        .await?;
                    messages.push(ChatMessage::tool_result(
                        tool_call.id.clone(),
                        tool_call.name.clone(),
                        result,
                    ));
                }
                continue;
            }

            match self.shape_reply(&response.content, run_id) {
                None => {
                    suppressed = true;
                    break;
                }
                Some(shaped) if !shaped.trim().is_empty() => {
                    final_content = Some(shaped);
                    break;
                }
                Some(_) => {
                    if asked_visible_reply {
                        final_content = Some(FALLBACK_REPLY.to_owned());
                        break;
                    }
                    asked_visible_reply = true;
                    messages.push(ChatMessage::assistant(response.content.clone()));
                    messages.push(ChatMessage::user(VISIBLE_REPLY_NUDGE));
                    tracing::warn!(run_id, "empty response from LLM, nudging for visible reply");
                }
            }
        }

        // Loop exhausted without a reply: one forced summary call, no tools.
        if final_content.is_none() && !suppressed {
            self.check_cancelled(run_id)?;
            tracing::warn!(run_id, "final reply missing, forcing summary reply");
            self.inject_steer_updates(run_id, &session.key, channel, chat_id, &mut messages);
            messages.push(ChatMessage::user(FORCED_SUMMARY_NUDGE));

            let (summary_response, streamed) = self
                .chat_with_optional_stream(
                    &messages,
                    false,
                    &active_model,
                    thinking_override,
                    run_id,
                    &session.key,
                    channel,
                    chat_id,
                    &mut delta_index,
                )
                .await?;
            usage_totals.merge(&summary_response.usage);
            if !streamed && !summary_response.content.trim().is_empty() {
                self.emit_assistant_deltas(
                    run_id,
                    &session.key,
                    channel,
                    chat_id,
                    &summary_response.content,
                    &mut delta_index,
                );
            }

            match self.shape_reply(&summary_response.content, run_id) {
                None => suppressed = true,
                Some(shaped) if !shaped.trim().is_empty() => final_content = Some(shaped),
                Some(_) => final_content = Some(FALLBACK_REPLY.to_owned()),
            }
        }

        Ok(DialogOutcome {
            final_content: if suppressed { None } else { final_content },
            usage: usage_totals,
        })
    }

    // ── Provider calls ─────────────────────────────────────────────

    /// Call the provider, streaming when enabled and supported. Returns the
    /// response and whether true deltas were forwarded.
    #[allow(clippy::too_many_arguments)]
    async fn chat_with_optional_stream(
        &self,
        messages: &[ChatMessage],
        with_tools: bool,
        model: &str,
        thinking: Option<ThinkingMode>,
        run_id: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        delta_index: &mut usize,
    ) -> Result<(LlmResponse, bool)> {
        let mut req = ChatRequest::new(messages.to_vec());
        req.model = model.to_owned();
        req.thinking = thinking;
        if with_tools {
            req.tools = self.inner.tools.definitions();
        }

        if self.inner.agent.stream_events && self.inner.provider.supports_streaming() {
            match self.inner.provider.stream_chat(&req).await {
                Ok(mut stream) => {
                    let mut had_deltas = false;
                    let mut final_response = None;
                    while let Some(event) = stream.next().await {
                        match event {
                            LlmStreamEvent::Delta { text } if !text.is_empty() => {
                                self.check_cancelled(run_id)?;
                                had_deltas = true;
                                self.inner.emitter.emit(
                                    AgentEvent::new(
                                        EventPayload::AssistantDelta {
                                            delta: text,
                                            index: *delta_index,
                                        },
                                        run_id,
                                        session_key,
                                    )
                                    .with_route(channel, chat_id),
                                );
                                *delta_index += 1;
                            }
                            LlmStreamEvent::Delta { .. } => {}
                            LlmStreamEvent::Final { response } => {
                                final_response = Some(response);
                            }
                        }
                    }
                    if let Some(response) = final_response {
                        return Ok((response, had_deltas));
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "streaming unavailable, falling back to chat");
                }
            }
        }

        let response = self.inner.provider.chat(&req).await?;
        Ok((response, false))
    }

    /// Post-hoc chunking for non-streamed responses: the dashboard receives
    /// the same `assistant_delta` shape either way.
    fn emit_assistant_deltas(
        &self,
        run_id: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        text: &str,
        delta_index: &mut usize,
    ) {
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(DELTA_CHUNK_SIZE) {
            self.inner.emitter.emit(
                AgentEvent::new(
                    EventPayload::AssistantDelta {
                        delta: chunk.iter().collect(),
                        index: *delta_index,
                    },
                    run_id,
                    session_key,
                )
                .with_route(channel, chat_id),
            );
            *delta_index += 1;
        }
    }

    // ── Steering ───────────────────────────────────────────────────

    fn inject_steer_updates(
        &self,
        run_id: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        messages: &mut Vec<ChatMessage>,
    ) {
        let updates = self.drain_steer_updates(run_id);
        if updates.is_empty() {
            return;
        }

        let lines: Vec<String> = updates
            .iter()
            .filter(|update| !update.text.trim().is_empty())
            .enumerate()
            .map(|(idx, update)| format!("{}. ({}) {}", idx + 1, update.source, update.text.trim()))
            .collect();
        if lines.is_empty() {
            return;
        }

        messages.push(ChatMessage::user(format!(
            "[system: steer update received during run. \
             Incorporate these adjustments for the next steps and final response.]\n{}",
            lines.join("\n")
        )));
        self.inner.emitter.emit(
            AgentEvent::new(
                EventPayload::RunSteerApplied { count: lines.len() },
                run_id,
                session_key,
            )
            .with_route(channel, chat_id),
        );
    }

    // ── Tool execution ─────────────────────────────────────────────

    async fn execute_tool_call(
        &self,
        tool_call: &ToolCall,
        run_id: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        sender_id: &str,
    ) -> Result<String> {
        self.check_cancelled(run_id)?;
        tracing::info!(
            run_id,
            tool = %tool_call.name,
            args = %preview(&tool_call.arguments.to_string(), 200),
            "tool call"
        );

        let pre_payload = serde_json::json!({
            "run_id": run_id,
            "session_key": session_key,
            "channel": channel,
            "chat_id": chat_id,
            "sender_id": sender_id,
            "tool_name": tool_call.name,
            "args": tool_call.arguments,
        });
        let pre_result = self
            .run_hook(HookEvent::PreToolUse, pre_payload, run_id, session_key)
            .await;
        if pre_result.blocked {
            let blocked_msg = format!(
                "Error: Tool '{}' blocked by PreToolUse hook",
                tool_call.name
            );
            self.emit_tool_end(
                run_id,
                session_key,
                channel,
                chat_id,
                &tool_call.name,
                &blocked_msg,
                true,
                false,
            );
            return Ok(blocked_msg);
        }

        self.check_cancelled(run_id)?;
        if let Some(limiter) = &self.inner.rate_limiter {
            if !limiter.check_tool_call(sender_id) {
                let rate_msg =
                    "Error: Rate limit exceeded for tool calls. Please try again later.".to_owned();
                self.emit_tool_end(
                    run_id,
                    session_key,
                    channel,
                    chat_id,
                    &tool_call.name,
                    &rate_msg,
                    false,
                    true,
                );
                return Ok(rate_msg);
            }
        }

        self.check_cancelled(run_id)?;
        let result = self
            .inner
            .tools
            .execute(&tool_call.name, tool_call.arguments.clone())
            .await;

        let post_payload = serde_json::json!({
            "run_id": run_id,
            "session_key": session_key,
            "channel": channel,
            "chat_id": chat_id,
            "sender_id": sender_id,
            "tool_name": tool_call.name,
            "args": tool_call.arguments,
            "result_preview": preview(&result, 1500),
        });
        self.run_hook(HookEvent::PostToolUse, post_payload, run_id, session_key)
            .await;
        Ok(result)
    }

    /// Emit a synthetic `tool_end` for calls rejected before execution
    /// (hook block, rate limit).
    #[allow(clippy::too_many_arguments)]
    fn emit_tool_end(
        &self,
        run_id: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        tool_name: &str,
        result: &str,
        blocked_by_hook: bool,
        rate_limited: bool,
    ) {
        self.inner.emitter.emit(
            AgentEvent::new(
                EventPayload::ToolEnd {
                    tool_name: tool_name.to_owned(),
                    params: Value::Object(Default::default()),
                    ok: false,
                    result: Value::String(result.to_owned()),
                    duration_ms: 0.0,
                    blocked_by_hook,
                    rate_limited,
                },
                run_id,
                session_key,
            )
            .with_route(channel, chat_id),
        );
    }

    // ── Reply shaping ──────────────────────────────────────────────

    /// Shape the final reply: strip the NO_REPLY token (suppressing entirely
    /// when nothing remains), and drop trivial "message sent" confirmations
    /// when the message tool already delivered output this run.
    pub(crate) fn shape_reply(&self, content: &str, run_id: &str) -> Option<String> {
        if !self.inner.agent.reply_shaping {
            return Some(content.trim().to_owned());
        }

        let token = self.inner.agent.no_reply_token.trim();
        let had_token = !token.is_empty() && content.contains(token);
        let text = if token.is_empty() {
            content.to_owned()
        } else {
            content.replace(token, "")
        };

        let shaped = text.trim();
        if had_token && shaped.is_empty() {
            return None;
        }
        if self.is_duplicate_message_confirmation(shaped, run_id) {
            return None;
        }
        Some(shaped.to_owned())
    }

    fn is_duplicate_message_confirmation(&self, reply: &str, run_id: &str) -> bool {
        if reply.is_empty() {
            return false;
        }
        if self.inner.message_tool.run_sends(run_id).is_empty() {
            return false;
        }

        let norm = reply
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if norm.len() > 180 {
            return false;
        }
        confirmation_patterns().iter().any(|p| p.is_match(&norm))
    }

    // ── Compaction ─────────────────────────────────────────────────

    /// Compact session history into a summary, emitting compaction events
    /// and running the PreCompact hook. Returns true when a summary was
    /// applied.
    pub(crate) async fn compact_session(
        &self,
        session: &mut Session,
        run_id: &str,
        reason: &str,
    ) -> bool {
        self.inner.emitter.emit(AgentEvent::new(
            EventPayload::CompactionStart {
                reason: reason.to_owned(),
                message_count: session.messages.len(),
            },
            run_id,
            &session.key,
        ));
        self.run_hook(
            HookEvent::PreCompact,
            serde_json::json!({
                "run_id": run_id,
                "session_key": session.key,
                "reason": reason,
                "message_count": session.messages.len(),
            }),
            run_id,
            &session.key,
        )
        .await;

        let summary = match generate_summary(&self.inner.provider, session, &self.inner.model).await
        {
            Ok(summary) => summary,
            Err(e) => {
                self.inner.emitter.emit(AgentEvent::new(
                    EventPayload::CompactionError {
                        reason: reason.to_owned(),
                        error: e.to_string(),
                    },
                    run_id,
                    &session.key,
                ));
                tracing::error!(run_id, error = %e, "compaction failed");
                return false;
            }
        };

        match summary {
            Some(summary) => {
                let summary_length = summary.len();
                apply_summary(session, summary);
                if let Err(e) = self.inner.sessions.save(session) {
                    tracing::warn!(error = %e, "failed to save compacted session");
                }
                self.inner.emitter.emit(AgentEvent::new(
                    EventPayload::CompactionEnd {
                        reason: reason.to_owned(),
                        ok: true,
                        summary_length,
                        remaining_messages: session.messages.len(),
                    },
                    run_id,
                    &session.key,
                ));
                true
            }
            None => {
                self.inner.emitter.emit(AgentEvent::new(
                    EventPayload::CompactionEnd {
                        reason: reason.to_owned(),
                        ok: false,
                        summary_length: 0,
                        remaining_messages: session.messages.len(),
                    },
                    run_id,
                    &session.key,
                ));
                false
            }
        }
    }
}

/// The duplicate-confirmation set is a stable contract: expanding it risks
/// hiding legitimate replies.
fn confirmation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^message sent(?: successfully)?(?: to [^\n]+)?\.?$",
            r"^sent (?:the )?message(?: to [^\n]+)?\.?$",
            r"^done\.?$",
            r"^completed\.?$",
            r"^all set\.?$",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_patterns_match_expected_set() {
        let patterns = confirmation_patterns();
        for sample in [
            "message sent",
            "message sent successfully",
            "message sent to telegram:42.",
            "sent the message",
            "done.",
            "completed",
            "all set.",
        ] {
            assert!(
                patterns.iter().any(|p| p.is_match(sample)),
                "expected match for {sample:?}"
            );
        }
        for sample in [
            "the message discusses the plan",
            "done with step one, two remain",
            "i sent a message and also booked the table",
        ] {
            assert!(
                !patterns.iter().any(|p| p.is_match(sample)),
                "unexpected match for {sample:?}"
            );
        }
    }
}
