//! In-process message bus.
//!
//! Carries inbound messages toward the agent loop, outbound replies toward
//! channel adapters, run events toward dashboard listeners, and approval
//! prompts/responses between the tool registry and the user. Publishes never
//! block the event loop: listener queues are unbounded and dead listeners
//! are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use courier_domain::event::{now_ts, AgentEvent};
use courier_domain::message::{InboundMessage, OutboundMessage};
use courier_tools::{ApprovalGate, ToolContext};

/// A tool call waiting for a user decision.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub run_id: String,
    pub tool: String,
    pub params: Value,
    pub created_at: f64,
}

pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    run_listeners: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    approval_listeners: Mutex<Vec<mpsc::UnboundedSender<ApprovalRequest>>>,
    pending_approvals: Mutex<Vec<ApprovalRequest>>,
    response_waiters: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            run_listeners: Mutex::new(Vec::new()),
            approval_listeners: Mutex::new(Vec::new()),
            pending_approvals: Mutex::new(Vec::new()),
            response_waiters: Mutex::new(HashMap::new()),
        }
    }

    // ── Inbound ────────────────────────────────────────────────────

    /// Publish an inbound message. When an approval is waiting on the
    /// message's session, the content resolves that wait instead of
    /// becoming a new run.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        let session_key = msg.session_key();
        if self.resolve_response(&session_key, &msg.content) {
            return;
        }
        let _ = self.inbound_tx.send(msg);
    }

    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    // ── Outbound ───────────────────────────────────────────────────

    pub fn publish_outbound(&self, msg: OutboundMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    /// Sender handle for tools that push outbound messages directly.
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    // ── Run events ─────────────────────────────────────────────────

    pub fn register_run_listener(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.run_listeners.lock().push(tx);
        rx
    }

    pub fn publish_run_event(&self, event: AgentEvent) {
        self.run_listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    // ── Approvals ──────────────────────────────────────────────────

    pub fn register_approval_listener(&self) -> mpsc::UnboundedReceiver<ApprovalRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.approval_listeners.lock().push(tx);
        rx
    }

    pub fn publish_approval(&self, request: ApprovalRequest) {
        self.pending_approvals.lock().push(request.clone());
        self.approval_listeners
            .lock()
            .retain(|listener| listener.send(request.clone()).is_ok());
    }

    pub fn resolve_pending_approval(&self, approval_id: &str) {
        self.pending_approvals.lock().retain(|p| p.id != approval_id);
    }

    pub fn list_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.pending_approvals.lock().clone()
    }

    // ── Approval responses ─────────────────────────────────────────

    /// Wait for the next inbound message on `session_key`, up to `timeout`.
    pub async fn wait_for_response(
        &self,
        session_key: &str,
        timeout: Duration,
    ) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.response_waiters
            .lock()
            .insert(session_key.to_owned(), tx);

        let result = tokio::time::timeout(timeout, rx).await;
        self.response_waiters.lock().remove(session_key);
        match result {
            Ok(Ok(text)) => Some(text),
            _ => None,
        }
    }

    /// Resolve a pending response wait. Returns true when a waiter consumed
    /// the text.
    pub fn resolve_response(&self, session_key: &str, text: &str) -> bool {
        if let Some(waiter) = self.response_waiters.lock().remove(session_key) {
            return waiter.send(text.to_owned()).is_ok();
        }
        false
    }

    pub fn has_response_waiter(&self, session_key: &str) -> bool {
        self.response_waiters.lock().contains_key(session_key)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool approval flow over the bus: publish the approval event, prompt the
/// user on their channel, and wait for an approve/deny reply.
pub struct BusApprovalGate {
    bus: Arc<MessageBus>,
}

impl BusApprovalGate {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait::async_trait]
impl ApprovalGate for BusApprovalGate {
    async fn request_approval(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        params: Value,
        timeout: Duration,
    ) -> bool {
        if ctx.channel.is_empty() || ctx.chat_id.is_empty() {
            return false;
        }

        let approval_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
        let request = ApprovalRequest {
            id: approval_id.clone(),
            session_key: ctx.session_key.clone(),
            channel: ctx.channel.clone(),
            chat_id: ctx.chat_id.clone(),
            run_id: ctx.run_id.clone(),
            tool: tool_name.to_owned(),
            params: params.clone(),
            created_at: now_ts(),
        };
        self.bus.publish_approval(request);

        let mut summary = params.to_string();
        if summary.len() > 300 {
            summary.truncate(300);
            summary.push_str("...");
        }
        self.bus.publish_outbound(OutboundMessage::new(
            ctx.channel.clone(),
            ctx.chat_id.clone(),
            format!(
                "Approval required for tool '{tool_name}'.\nParams: {summary}\nReply with 'approve' or 'deny'."
            ),
        ));

        let response = self.bus.wait_for_response(&ctx.session_key, timeout).await;
        self.bus.resolve_pending_approval(&approval_id);

        match response.as_deref().map(|r| r.trim().to_ascii_lowercase()) {
            Some(reply) => matches!(reply.as_str(), "approve" | "approved" | "yes" | "y"),
            None => false,
        }
    }
}
