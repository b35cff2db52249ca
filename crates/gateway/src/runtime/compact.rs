//! Session compaction via LLM summarization.
//!
//! Messages older than the last `KEEP_RECENT` are summarized into the
//! session's `summary` field and dropped. Triggered by history length,
//! token pressure, and provider overload retries.

use std::sync::Arc;

use courier_domain::error::Result;
use courier_domain::tool::ChatMessage;
use courier_providers::{ChatRequest, LlmProvider};
use courier_sessions::Session;

pub(crate) const KEEP_RECENT: usize = 10;

/// Summarize everything but the most recent messages. Returns `None` when
/// there is nothing to compact.
pub(crate) async fn generate_summary(
    provider: &Arc<dyn LlmProvider>,
    session: &Session,
    model: &str,
) -> Result<Option<String>> {
    if session.messages.len() <= KEEP_RECENT {
        return Ok(None);
    }
    let to_summarize = &session.messages[..session.messages.len() - KEEP_RECENT];

    let mut lines = Vec::new();
    for msg in to_summarize {
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }
        let mut snippet = content.to_owned();
        if snippet.len() > 500 {
            let mut end = 500;
            while end > 0 && !snippet.is_char_boundary(end) {
                end -= 1;
            }
            snippet.truncate(end);
        }
        lines.push(format!("{}: {snippet}", msg.role));
    }
    if lines.is_empty() {
        return Ok(None);
    }

    let prompt = format!(
        "Summarize the following conversation concisely, preserving key facts, \
         decisions, and context that would be needed to continue the conversation:\n\n{}",
        lines.join("\n")
    );
    let mut req = ChatRequest::new(vec![
        ChatMessage::system("You are a conversation summarizer. Be concise."),
        ChatMessage::user(prompt),
    ]);
    req.model = model.to_owned();
    req.max_tokens = 1024;

    let response = provider.chat(&req).await?;
    let summary = response.content.trim().to_owned();
    if summary.is_empty() {
        return Ok(None);
    }
    tracing::info!(
        compacted = to_summarize.len(),
        summary_len = summary.len(),
        "session history compacted"
    );
    Ok(Some(summary))
}

/// Apply a generated summary: replace the older portion of the history.
pub(crate) fn apply_summary(session: &mut Session, summary: String) {
    session.summary = summary;
    if session.messages.len() > KEEP_RECENT {
        let keep_from = session.messages.len() - KEEP_RECENT;
        session.messages.drain(..keep_from);
    }
}
