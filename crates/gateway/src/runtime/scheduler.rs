//! Per-session run scheduler.
//!
//! `submit_inbound` applies the configured queue policy (queue / collect /
//! steer / followup / steer_backlog), enforces the backlog cap, and spawns
//! one task per run. Each run task acquires the per-session lock (and the
//! global semaphore when configured), drives one dialog turn under the run
//! timeout, and publishes every lifecycle transition on the bus. `/cancel`
//! bypasses both locks so it can always reach the cancellation path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use courier_domain::config::{AgentConfig, QueueConfig, QueueMode, ThinkingMode};
use courier_domain::error::{Error, Result};
use courier_domain::event::{AgentEvent, EventPayload};
use courier_domain::message::{InboundMessage, OutboundMessage};
use courier_providers::LlmProvider;
use courier_sessions::{RunHistoryStore, RunState, RunStatus, Session, SessionManager};
use courier_tools::message::MessageTool;
use courier_tools::{ToolContext, ToolRegistry};

use crate::audit::AuditLogger;
use crate::bus::{BusApprovalGate, MessageBus};
use crate::context::ContextBuilder;
use crate::hooks::{HookEvent, HookRunner};
use crate::ratelimit::RateLimiter;
use crate::runtime::cancel::CancelMap;
use crate::runtime::preview;
use crate::state::AgentDeps;
use crate::usage::UsageTracker;

const RECENT_RUNS_CAP: usize = 200;
const CLOSED_RUNS_CAP: usize = 1500;
const RUN_HISTORY_MAX_RECORDS: usize = 5000;
const STEER_BUFFER_CAP: usize = 32;

#[derive(Debug, Clone)]
pub(crate) struct SteerUpdate {
    pub text: String,
    pub source: String,
    pub sender_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Publishes run events, suppressing everything but terminal lifecycle
/// events for closed or cancel-requested run ids.
pub(crate) struct EventEmitter {
    bus: Arc<MessageBus>,
    stream_events: bool,
    cancel_requested: Mutex<HashSet<String>>,
    closed: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl EventEmitter {
    fn new(bus: Arc<MessageBus>, stream_events: bool) -> Self {
        Self {
            bus,
            stream_events,
            cancel_requested: Mutex::new(HashSet::new()),
            closed: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if !self.stream_events {
            return;
        }
        let run_id = event.run_id.as_str();
        if !run_id.is_empty() {
            if self.closed.lock().0.contains(run_id) && !event.payload.is_terminal() {
                return;
            }
            if self.cancel_requested.lock().contains(run_id)
                && !matches!(event.payload, EventPayload::RunCancelled { .. })
            {
                return;
            }
        }
        self.bus.publish_run_event(event);
    }

    fn request_cancel(&self, run_id: &str) {
        self.cancel_requested.lock().insert(run_id.to_owned());
    }

    fn clear_cancel(&self, run_id: &str) {
        self.cancel_requested.lock().remove(run_id);
    }

    fn is_cancel_requested(&self, run_id: &str) -> bool {
        self.cancel_requested.lock().contains(run_id)
    }

    fn mark_closed(&self, run_id: &str) {
        let mut closed = self.closed.lock();
        if closed.0.insert(run_id.to_owned()) {
            closed.1.push_back(run_id.to_owned());
            while closed.1.len() > CLOSED_RUNS_CAP {
                if let Some(old) = closed.1.pop_front() {
                    closed.0.remove(&old);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl courier_tools::ToolEventSink for EventEmitter {
    async fn emit(&self, event: AgentEvent) {
        EventEmitter::emit(self, event);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct SessionQueue {
    pub session_key: String,
    pub running: Option<RunState>,
    pub queued: Vec<RunState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub mode: String,
    pub collect_window_ms: u64,
    pub max_backlog: usize,
    pub sessions: Vec<SessionQueue>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct Inner {
    pub(crate) agent: AgentConfig,
    pub(crate) queue: QueueConfig,
    pub(crate) model: String,
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) run_history: Arc<RunHistoryStore>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) message_tool: Arc<MessageTool>,
    pub(crate) context: Arc<ContextBuilder>,
    pub(crate) hooks: Arc<HookRunner>,
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
    pub(crate) audit: Option<Arc<AuditLogger>>,
    pub(crate) usage: Option<Arc<UsageTracker>>,
    pub(crate) emitter: Arc<EventEmitter>,

    pub(crate) session_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub(crate) global_semaphore: Option<Arc<Semaphore>>,
    pub(crate) active_runs: Mutex<HashMap<String, RunState>>,
    pub(crate) run_messages: Mutex<HashMap<String, InboundMessage>>,
    pub(crate) steer_buffers: Mutex<HashMap<String, VecDeque<SteerUpdate>>>,
    pub(crate) recent_runs: Mutex<VecDeque<RunState>>,
    pub(crate) cancels: CancelMap,
    pub(crate) run_tasks: Mutex<HashMap<String, JoinHandle<Option<OutboundMessage>>>>,
    pub(crate) running: AtomicBool,
}

#[derive(Clone)]
pub struct AgentLoop {
    pub(crate) inner: Arc<Inner>,
}

impl AgentLoop {
    pub fn new(deps: AgentDeps) -> Self {
        let AgentDeps {
            config,
            workspace,
            data_dir,
            bus,
            provider,
            rate_limiter,
            audit,
            usage,
        } = deps;

        let model = if config.agent.model.is_empty() {
            provider.default_model().to_owned()
        } else {
            config.agent.model.clone()
        };

        let sessions = Arc::new(SessionManager::new(
            &workspace,
            &data_dir.join("sessions"),
            config.sessions.idle_reset_minutes,
        ));
        let run_history = Arc::new(RunHistoryStore::new(
            &data_dir.join("runs"),
            RUN_HISTORY_MAX_RECORDS,
        ));
        let emitter = Arc::new(EventEmitter::new(bus.clone(), config.agent.stream_events));

        let tools = Arc::new(ToolRegistry::new(
            config.approval.clone(),
            Duration::from_secs(config.agent.approval_timeout_s),
        ));
        tools.set_approval_gate(Arc::new(BusApprovalGate::new(bus.clone())));
        tools.set_event_sink(emitter.clone());
        if let Some(audit) = &audit {
            tools.set_audit(audit.clone());
        }

        // Built-in tool set.
        let allowed_dir = if config.agent.restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };
        tools.register(Arc::new(courier_tools::fs::ReadFileTool::new(
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(courier_tools::fs::WriteFileTool::new(
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(courier_tools::fs::EditFileTool::new(
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(courier_tools::patch::ApplyPatchTool::new(
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(courier_tools::fs::ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(courier_tools::shell::ExecTool::new(
            workspace.clone(),
            &config.exec,
            &config.sandbox,
            config.agent.agent_id.clone(),
            config.agent.restrict_to_workspace,
        )));
        let message_tool = Arc::new(MessageTool::new(bus.outbound_sender()));
        tools.register(message_tool.clone());

        let context = Arc::new(ContextBuilder::new(&workspace, config.agent.supports_vision));
        let hooks = Arc::new(HookRunner::new(&workspace, &config.hooks));

        let global_semaphore = if config.queue.global_cap && config.queue.max_concurrency > 0 {
            Some(Arc::new(Semaphore::new(config.queue.max_concurrency)))
        } else {
            None
        };

        let inner = Arc::new(Inner {
            agent: config.agent,
            queue: config.queue,
            model,
            bus,
            provider,
            sessions,
            run_history: run_history.clone(),
            tools,
            message_tool,
            context,
            hooks,
            rate_limiter,
            audit,
            usage,
            emitter,
            session_locks: Mutex::new(HashMap::new()),
            global_semaphore,
            active_runs: Mutex::new(HashMap::new()),
            run_messages: Mutex::new(HashMap::new()),
            steer_buffers: Mutex::new(HashMap::new()),
            recent_runs: Mutex::new(VecDeque::new()),
            cancels: CancelMap::new(),
            run_tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        });

        let agent = Self { inner };
        agent.load_persisted_runs();
        agent
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    fn load_persisted_runs(&self) {
        let rows = self.inner.run_history.load_recent(RECENT_RUNS_CAP);
        let mut recent = self.inner.recent_runs.lock();
        for run in rows {
            if run.run_id.is_empty() {
                continue;
            }
            recent.push_back(run);
        }
    }

    // ── Main consume loop ──────────────────────────────────────────

    /// Consume inbound messages from the bus until [`stop`](Self::stop).
    pub async fn run(&self) {
        self.inner.running.store(true, Ordering::Release);
        tracing::info!("agent loop started");
        while self.inner.running.load(Ordering::Acquire) {
            let msg = tokio::time::timeout(
                Duration::from_secs(1),
                self.inner.bus.consume_inbound(),
            )
            .await;
            match msg {
                Ok(Some(msg)) => {
                    self.submit_inbound(msg, true);
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    /// Stop the loop and cancel all active runs.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        tracing::info!("agent loop stopping");
        let run_ids: Vec<String> = self.inner.active_runs.lock().keys().cloned().collect();
        for run_id in run_ids {
            self.cancel_run(&run_id);
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = inner
                .hooks
                .run(HookEvent::Stop, &serde_json::json!({"reason": "agent_stop"}))
                .await;
        });
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Submit an inbound message. Returns the id of the run that will (or
    /// already does) carry it.
    pub fn submit_inbound(&self, msg: InboundMessage, publish_outbound: bool) -> String {
        let session_key = msg.session_key();
        let mode = self.inner.queue.mode;

        if !is_session_control_command(&msg.content) {
            let running = self.find_running_run(&session_key);
            let queued = self.list_queued_runs(&session_key);

            if matches!(mode, QueueMode::Steer | QueueMode::SteerBacklog) {
                if let Some(running) = &running {
                    let steered = self.steer_run_from(
                        &running.run_id,
                        &msg.content,
                        "inbound",
                        &msg.sender_id,
                    );
                    if steered && mode == QueueMode::Steer {
                        return running.run_id.clone();
                    }
                    if steered && mode == QueueMode::SteerBacklog {
                        if let Some(run_id) = self.replace_latest_queued(&queued, &msg) {
                            return run_id;
                        }
                    }
                }
            }

            if mode == QueueMode::Collect {
                if let Some(run_id) = self.merge_collect_queued(&queued, &msg) {
                    return run_id;
                }
            }

            if mode == QueueMode::Followup {
                if let Some(run_id) = self.replace_latest_queued(&queued, &msg) {
                    return run_id;
                }
            }

            if queued.len() >= self.inner.queue.max_backlog {
                let target = queued[0].run_id.clone();
                if self.replace_queued_message(&target, &msg, MergeMode::Replace, "overflow_replace")
                {
                    return target;
                }
            }
        }

        let run_id = RunState::new_run_id();
        self.register_run_state(&run_id, &msg);
        self.start_run_task(&run_id, msg, publish_outbound);
        run_id
    }

    /// Process a message directly and wait for its reply (CLI, cron,
    /// dashboard chat).
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        model_override: Option<&str>,
    ) -> String {
        let mut msg = InboundMessage::new(channel, "user", chat_id, content);
        msg.metadata.insert(
            "session_key".into(),
            serde_json::Value::String(session_key.to_owned()),
        );
        if let Some(model) = model_override {
            msg.metadata.insert(
                "model_override".into(),
                serde_json::Value::String(model.to_owned()),
            );
        }

        let run_id = self.submit_inbound(msg, false);
        let handle = self.inner.run_tasks.lock().remove(&run_id);
        match handle {
            Some(handle) => match handle.await {
                Ok(Some(response)) => response.content,
                _ => String::new(),
            },
            None => String::new(),
        }
    }

    fn register_run_state(&self, run_id: &str, msg: &InboundMessage) -> RunState {
        let mut run = RunState::new(run_id, msg.session_key());
        run.channel = msg.channel.clone();
        run.chat_id = msg.chat_id.clone();
        run.model = self.inner.model.clone();
        self.inner
            .active_runs
            .lock()
            .insert(run_id.to_owned(), run.clone());
        run
    }

    fn start_run_task(&self, run_id: &str, msg: InboundMessage, publish_outbound: bool) {
        self.inner
            .run_messages
            .lock()
            .insert(run_id.to_owned(), msg.clone());
        // Register the cancel token before spawning so a cancel issued right
        // after submission always lands.
        self.inner.cancels.register(run_id);
        let this = self.clone();
        let run_id_owned = run_id.to_owned();
        let handle = tokio::spawn(async move {
            this.run_with_lifecycle(msg, run_id_owned, publish_outbound)
                .await
        });
        self.inner
            .run_tasks
            .lock()
            .insert(run_id.to_owned(), handle);
    }

    // ── Queue transforms ───────────────────────────────────────────

    fn find_running_run(&self, session_key: &str) -> Option<RunState> {
        self.inner
            .active_runs
            .lock()
            .values()
            .filter(|run| run.session_key == session_key && run.status == RunStatus::Running)
            .min_by_key(|run| run.created_at)
            .cloned()
    }

    fn list_queued_runs(&self, session_key: &str) -> Vec<RunState> {
        let mut queued: Vec<RunState> = self
            .inner
            .active_runs
            .lock()
            .values()
            .filter(|run| run.session_key == session_key && run.status == RunStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|run| run.created_at);
        queued
    }

    fn merge_collect_queued(&self, queued: &[RunState], msg: &InboundMessage) -> Option<String> {
        let latest = queued.last()?;
        let elapsed_ms = (Utc::now() - latest.created_at).num_milliseconds().max(0) as u64;
        if elapsed_ms > self.inner.queue.collect_window_ms {
            return None;
        }
        if self.replace_queued_message(&latest.run_id, msg, MergeMode::Collect, "collect_merge") {
            Some(latest.run_id.clone())
        } else {
            None
        }
    }

    fn replace_latest_queued(&self, queued: &[RunState], msg: &InboundMessage) -> Option<String> {
        let latest = queued.last()?;
        if self.replace_queued_message(&latest.run_id, msg, MergeMode::Replace, "followup_replace")
        {
            Some(latest.run_id.clone())
        } else {
            None
        }
    }

    fn replace_queued_message(
        &self,
        run_id: &str,
        msg: &InboundMessage,
        mode: MergeMode,
        reason: &str,
    ) -> bool {
        let session_key = {
            let active = self.inner.active_runs.lock();
            match active.get(run_id) {
                Some(run) if run.status == RunStatus::Queued => run.session_key.clone(),
                _ => return false,
            }
        };

        {
            let mut run_messages = self.inner.run_messages.lock();
            let queued_msg = match run_messages.get_mut(run_id) {
                Some(queued_msg) => queued_msg,
                None => return false,
            };

            let existing = queued_msg.content.trim().to_owned();
            let incoming = msg.content.trim();
            match mode {
                MergeMode::Collect => {
                    if !existing.is_empty() && !incoming.is_empty() {
                        queued_msg.content =
                            format!("{existing}\n\n[Collected Followup]\n{incoming}");
                    } else if !incoming.is_empty() {
                        queued_msg.content = incoming.to_owned();
                    }
                }
                MergeMode::Replace => {
                    queued_msg.content = msg.content.clone();
                }
            }

            // Media lists are unioned, preserving order.
            for item in &msg.media {
                if !queued_msg.media.contains(item) {
                    queued_msg.media.push(item.clone());
                }
            }
            // Metadata is shallow-merged; session_key routing is pinned.
            for (key, value) in &msg.metadata {
                if key == "session_key" {
                    continue;
                }
                queued_msg.metadata.insert(key.clone(), value.clone());
            }
            queued_msg.timestamp = msg.timestamp;
        }

        self.inner.emitter.emit(
            AgentEvent::new(
                EventPayload::QueueUpdate {
                    mode: self.inner.queue.mode.as_str().to_owned(),
                    reason: reason.to_owned(),
                },
                run_id,
                session_key,
            ),
        );
        true
    }

    // ── Steering ───────────────────────────────────────────────────

    /// Queue a steer instruction for an in-flight run (API surface).
    pub fn steer_run(&self, run_id: &str, instruction: &str) -> bool {
        self.steer_run_from(run_id, instruction, "api", "")
    }

    fn steer_run_from(
        &self,
        run_id: &str,
        instruction: &str,
        source: &str,
        sender_id: &str,
    ) -> bool {
        let text = instruction.trim();
        if text.is_empty() {
            return false;
        }
        let session_key = {
            let active = self.inner.active_runs.lock();
            match active.get(run_id) {
                Some(run) if run.status == RunStatus::Running => run.session_key.clone(),
                _ => return false,
            }
        };

        let pending = {
            let mut buffers = self.inner.steer_buffers.lock();
            let buffer = buffers.entry(run_id.to_owned()).or_default();
            buffer.push_back(SteerUpdate {
                text: text.to_owned(),
                source: source.to_owned(),
                sender_id: sender_id.to_owned(),
            });
            while buffer.len() > STEER_BUFFER_CAP {
                buffer.pop_front();
            }
            buffer.len()
        };

        self.inner.emitter.emit(AgentEvent::new(
            EventPayload::RunSteer {
                source: source.to_owned(),
                sender_id: sender_id.to_owned(),
                instruction_preview: preview(text, 180),
                pending,
            },
            run_id,
            session_key,
        ));
        true
    }

    pub(crate) fn drain_steer_updates(&self, run_id: &str) -> Vec<SteerUpdate> {
        self.inner
            .steer_buffers
            .lock()
            .get_mut(run_id)
            .map(|buffer| buffer.drain(..).collect())
            .unwrap_or_default()
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Cancel a queued or running run by id.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.inner.emitter.request_cancel(run_id);
        {
            let mut active = self.inner.active_runs.lock();
            if let Some(run) = active.get_mut(run_id) {
                if run.status == RunStatus::Queued {
                    run.error = Some("Run cancelled".into());
                }
            }
        }
        self.inner.cancels.cancel(run_id)
    }

    pub(crate) fn check_cancelled(&self, run_id: &str) -> Result<()> {
        if self.inner.emitter.is_cancel_requested(run_id) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Active and recent runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Vec<RunState> {
        let limit = limit.clamp(1, 500);
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let mut active: Vec<RunState> =
            self.inner.active_runs.lock().values().cloned().collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for run in active {
            seen.insert(run.run_id.clone());
            out.push(run);
        }
        for run in self.inner.recent_runs.lock().iter() {
            if out.len() >= limit {
                break;
            }
            if seen.insert(run.run_id.clone()) {
                out.push(run.clone());
            }
        }
        out.truncate(limit);
        out
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunState> {
        if let Some(run) = self.inner.active_runs.lock().get(run_id) {
            return Some(run.clone());
        }
        self.inner
            .recent_runs
            .lock()
            .iter()
            .find(|run| run.run_id == run_id)
            .cloned()
    }

    /// Queue/backlog state grouped by session.
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        let mut sessions: HashMap<String, SessionQueue> = HashMap::new();
        for run in self.inner.active_runs.lock().values() {
            if !matches!(run.status, RunStatus::Queued | RunStatus::Running) {
                continue;
            }
            let entry = sessions
                .entry(run.session_key.clone())
                .or_insert_with(|| SessionQueue {
                    session_key: run.session_key.clone(),
                    running: None,
                    queued: Vec::new(),
                });
            if run.status == RunStatus::Running {
                entry.running = Some(run.clone());
            } else {
                entry.queued.push(run.clone());
            }
        }
        let mut ordered: Vec<SessionQueue> = sessions.into_values().collect();
        ordered.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        for entry in &mut ordered {
            entry.queued.sort_by_key(|run| run.created_at);
        }
        QueueSnapshot {
            mode: self.inner.queue.mode.as_str().to_owned(),
            collect_window_ms: self.inner.queue.collect_window_ms,
            max_backlog: self.inner.queue.max_backlog,
            sessions: ordered,
        }
    }

    // ── Run lifecycle ──────────────────────────────────────────────

    async fn run_with_lifecycle(
        self,
        msg: InboundMessage,
        run_id: String,
        publish_outbound: bool,
    ) -> Option<OutboundMessage> {
        let session_key = msg.session_key();
        let token = self
            .inner
            .cancels
            .get(&run_id)
            .unwrap_or_else(|| self.inner.cancels.register(&run_id));
        let is_cancel_cmd = is_cancel_command(&msg.content);

        let session_started = Arc::new(AtomicBool::new(false));
        let typing_started = Arc::new(AtomicBool::new(false));

        let response = tokio::select! {
            _ = token.cancelled_wait() => {
                self.mark_run_cancelled(&run_id, &msg).await;
                None
            }
            out = self.acquire_and_execute(
                &msg,
                &run_id,
                &session_key,
                publish_outbound,
                is_cancel_cmd,
                &session_started,
                &typing_started,
            ) => out,
        };

        self.finish_run(
            &msg,
            &run_id,
            publish_outbound,
            session_started.load(Ordering::Acquire),
            typing_started.load(Ordering::Acquire),
        )
        .await;

        if publish_outbound {
            if let Some(response) = &response {
                self.inner.bus.publish_outbound(response.clone());
            }
        }
        response
    }

    #[allow(clippy::too_many_arguments)]
    async fn acquire_and_execute(
        &self,
        msg: &InboundMessage,
        run_id: &str,
        session_key: &str,
        publish_outbound: bool,
        is_cancel_cmd: bool,
        session_started: &Arc<AtomicBool>,
        typing_started: &Arc<AtomicBool>,
    ) -> Option<OutboundMessage> {
        // `/cancel` bypasses both locks: it must run even while the session
        // lock is held by the run it is about to cancel.
        let _global_permit = match (&self.inner.global_semaphore, is_cancel_cmd) {
            (Some(semaphore), false) => semaphore.clone().acquire_owned().await.ok(),
            _ => None,
        };
        let _session_permit = if is_cancel_cmd {
            None
        } else {
            let lock = self
                .inner
                .session_locks
                .lock()
                .entry(session_key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone();
            lock.acquire_owned().await.ok()
        };

        if self.check_cancelled(run_id).is_err() {
            self.mark_run_cancelled(run_id, msg).await;
            return None;
        }

        // Transition to running.
        self.update_run(run_id, |run| {
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
        });
        self.emit_lifecycle(
            EventPayload::RunStart {
                sender_id: msg.sender_id.clone(),
            },
            run_id,
            msg,
        );

        if publish_outbound && supports_typing_control(&msg.channel) {
            self.inner.bus.publish_outbound(OutboundMessage::control(
                msg.channel.clone(),
                msg.chat_id.clone(),
                "typing_start",
            ));
            typing_started.store(true, Ordering::Release);
        }

        session_started.store(true, Ordering::Release);
        self.run_hook(
            HookEvent::SessionStart,
            serde_json::json!({
                "run_id": run_id,
                "session_key": session_key,
                "channel": msg.channel,
                "chat_id": msg.chat_id,
                "sender_id": msg.sender_id,
            }),
            run_id,
            session_key,
        )
        .await;

        let timeout = Duration::from_secs(self.inner.agent.timeout_seconds.max(1));
        let outcome = tokio::time::timeout(timeout, self.process_message(msg, run_id)).await;

        match outcome {
            Ok(Ok(out)) => {
                let has_response = out
                    .as_ref()
                    .map(|o| !o.content.trim().is_empty())
                    .unwrap_or(false);
                self.update_run(run_id, |run| run.status = RunStatus::Completed);
                self.emit_lifecycle(
                    EventPayload::RunEnd {
                        sender_id: msg.sender_id.clone(),
                        has_response,
                    },
                    run_id,
                    msg,
                );
                out
            }
            Ok(Err(Error::Cancelled)) => {
                self.mark_run_cancelled(run_id, msg).await;
                None
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                tracing::error!(run_id, error = %error, "error processing run");
                self.update_run(run_id, |run| {
                    run.status = RunStatus::Error;
                    run.error = Some(error.clone());
                });
                self.emit_lifecycle(
                    EventPayload::RunError {
                        sender_id: msg.sender_id.clone(),
                        error: error.clone(),
                    },
                    run_id,
                    msg,
                );
                Some(
                    OutboundMessage::new(
                        msg.channel.clone(),
                        msg.chat_id.clone(),
                        format!("Sorry, I encountered an error: {error}"),
                    )
                    .with_reply_to(msg.message_id()),
                )
            }
            Err(_) => {
                let seconds = self.inner.agent.timeout_seconds;
                let error = format!("Run timed out after {seconds} seconds");
                self.update_run(run_id, |run| {
                    run.status = RunStatus::Error;
                    run.error = Some(error.clone());
                });
                self.emit_lifecycle(
                    EventPayload::RunError {
                        sender_id: msg.sender_id.clone(),
                        error,
                    },
                    run_id,
                    msg,
                );
                Some(OutboundMessage::new(
                    msg.channel.clone(),
                    msg.chat_id.clone(),
                    format!("Sorry, this run timed out after {seconds} seconds."),
                ))
            }
        }
    }

    async fn mark_run_cancelled(&self, run_id: &str, msg: &InboundMessage) {
        self.update_run(run_id, |run| {
            if !run.status.is_terminal() {
                run.status = RunStatus::Cancelled;
                run.error = Some("Run cancelled".into());
            }
        });
        self.emit_lifecycle(
            EventPayload::RunCancelled {
                sender_id: msg.sender_id.clone(),
            },
            run_id,
            msg,
        );
    }

    /// The always-run tail of a run: typing stop, SessionEnd hook,
    /// archival, bookkeeping cleanup, usage recording.
    async fn finish_run(
        &self,
        msg: &InboundMessage,
        run_id: &str,
        publish_outbound: bool,
        session_started: bool,
        typing_started: bool,
    ) {
        if typing_started && publish_outbound && supports_typing_control(&msg.channel) {
            self.inner.bus.publish_outbound(OutboundMessage::control(
                msg.channel.clone(),
                msg.chat_id.clone(),
                "typing_stop",
            ));
        }

        self.update_run(run_id, |run| run.ended_at = Some(Utc::now()));
        let run = self.inner.active_runs.lock().get(run_id).cloned();

        if session_started {
            if let Some(run) = &run {
                self.run_hook(
                    HookEvent::SessionEnd,
                    serde_json::json!({
                        "run_id": run_id,
                        "session_key": run.session_key,
                        "status": run.status.as_str(),
                        "error": run.error,
                    }),
                    run_id,
                    &run.session_key,
                )
                .await;
            }
        }

        if let Some(run) = run {
            self.store_run_on_session(&run);
            self.archive_run(run.clone());

            if run.usage_total_tokens > 0 {
                if let Some(usage) = &self.inner.usage {
                    let mut metadata = serde_json::Map::new();
                    metadata.insert(
                        "channel".into(),
                        serde_json::Value::String(run.channel.clone()),
                    );
                    metadata.insert(
                        "status".into(),
                        serde_json::Value::String(run.status.as_str().into()),
                    );
                    usage.record(
                        "agent",
                        &run.model,
                        run.usage_prompt_tokens,
                        run.usage_completion_tokens,
                        run.usage_total_tokens,
                        &run.run_id,
                        &run.session_key,
                        &run.session_key,
                        metadata,
                    );
                }
            }
        }

        self.inner.run_tasks.lock().remove(run_id);
        self.inner.run_messages.lock().remove(run_id);
        self.inner.steer_buffers.lock().remove(run_id);
        self.inner.message_tool.clear_run_sends(run_id);
        self.inner.cancels.remove(run_id);
        self.inner.emitter.clear_cancel(run_id);
        self.inner.emitter.mark_closed(run_id);
    }

    fn archive_run(&self, run: RunState) {
        self.inner.active_runs.lock().remove(&run.run_id);
        let mut recent = self.inner.recent_runs.lock();
        recent.push_front(run.clone());
        while recent.len() > RECENT_RUNS_CAP {
            recent.pop_back();
        }
        drop(recent);
        self.inner.run_history.append(&run);
    }

    fn store_run_on_session(&self, run: &RunState) {
        let mut session = self.inner.sessions.get_or_create(&run.session_key);
        session.set_last_run(run);
        if let Err(e) = self.inner.sessions.save(&session) {
            tracing::debug!(run_id = %run.run_id, error = %e, "failed to persist run metadata");
        }
    }

    pub(crate) fn update_run(&self, run_id: &str, f: impl FnOnce(&mut RunState)) {
        if let Some(run) = self.inner.active_runs.lock().get_mut(run_id) {
            f(run);
        }
    }

    fn emit_lifecycle(&self, payload: EventPayload, run_id: &str, msg: &InboundMessage) {
        if let Some(audit) = &self.inner.audit {
            let error = match &payload {
                EventPayload::RunError { error, .. } => Some(error.clone()),
                _ => None,
            };
            audit.log_event(
                payload.type_name(),
                serde_json::json!({
                    "run_id": run_id,
                    "session_key": msg.session_key(),
                    "channel": msg.channel,
                    "chat_id": msg.chat_id,
                    "error": error,
                }),
            );
        }
        self.inner.emitter.emit(
            AgentEvent::new(payload, run_id, msg.session_key())
                .with_route(msg.channel.clone(), msg.chat_id.clone()),
        );
    }

    pub(crate) async fn run_hook(
        &self,
        event: HookEvent,
        payload: serde_json::Value,
        run_id: &str,
        session_key: &str,
    ) -> crate::hooks::HookRunResult {
        let result = self.inner.hooks.run(event, &payload).await;
        if !result.errors.is_empty() {
            self.inner.emitter.emit(AgentEvent::new(
                EventPayload::HookError {
                    event: event.as_str().to_owned(),
                    errors: result.errors.clone(),
                },
                run_id,
                session_key,
            ));
        }
        result
    }

    // ── Message processing ─────────────────────────────────────────

    async fn process_message(
        &self,
        msg: &InboundMessage,
        run_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        if msg.channel == "system" {
            return self.process_system_message(msg, run_id).await;
        }

        tracing::info!(
            run_id,
            channel = %msg.channel,
            sender = %msg.sender_id,
            preview = %preview(&msg.content, 80),
            "processing message"
        );
        if let Some(audit) = &self.inner.audit {
            audit.log_message("inbound", &msg.channel, msg.content.len(), &msg.sender_id);
        }

        if let Some(limiter) = &self.inner.rate_limiter {
            if !limiter.check_message(&msg.sender_id) {
                return Ok(Some(
                    OutboundMessage::new(
                        msg.channel.clone(),
                        msg.chat_id.clone(),
                        "You're sending messages too quickly. Please wait a bit and try again.",
                    )
                    .with_reply_to(msg.message_id()),
                ));
            }
        }

        let session_key = msg.session_key();
        let mut session = self.inner.sessions.get_or_create(&session_key);
        if self.inner.sessions.apply_idle_reset(&mut session) {
            self.inner.emitter.emit(
                AgentEvent::new(EventPayload::SessionIdleReset, run_id, &session_key)
                    .with_route(msg.channel.clone(), msg.chat_id.clone()),
            );
        }

        if let Some(response) = self.handle_session_command(msg, run_id, &mut session) {
            return Ok(Some(response));
        }

        // Inline /think:<mode> prefix on a normal message.
        let mut thinking_override = session
            .thinking_mode()
            .and_then(|mode| ThinkingMode::parse(&mode));
        let mut content = msg.content.trim().to_owned();
        if let Some(rest) = strip_think_prefix(&content) {
            thinking_override = rest.0;
            content = rest.1;
        }

        let model_override = msg.model_override();
        let outcome = self
            .run_dialog(
                &mut session,
                &content,
                &msg.channel,
                &msg.chat_id,
                &msg.sender_id,
                &msg.media,
                run_id,
                thinking_override,
                None,
                model_override.as_deref(),
            )
            .await?;

        let active_model = model_override.unwrap_or_else(|| self.inner.model.clone());
        session.add_message("user", content);
        if let Some(final_content) = &outcome.final_content {
            if !final_content.trim().is_empty() {
                session.add_message("assistant", final_content.clone());
            }
        }
        if let Err(e) = self.inner.sessions.save(&session) {
            tracing::warn!(session_key = %session.key, error = %e, "failed to save session");
        }

        self.update_run(run_id, |run| {
            run.model = active_model.clone();
            run.usage_prompt_tokens = outcome.usage.prompt_tokens;
            run.usage_completion_tokens = outcome.usage.completion_tokens;
            run.usage_total_tokens = outcome.usage.total_tokens;
        });

        if let Some(final_content) = &outcome.final_content {
            if !final_content.trim().is_empty() {
                if let Some(audit) = &self.inner.audit {
                    audit.log_message("outbound", &msg.channel, final_content.len(), &msg.chat_id);
                }
            }
        }

        // Token pressure: compact once the turn total crosses 85% of the
        // context window.
        let threshold = (self.inner.agent.context_window as f64 * 0.85) as u64;
        if outcome.usage.total_tokens > 0 && outcome.usage.total_tokens > threshold {
            let mut session = self.inner.sessions.get_or_create(&session_key);
            self.compact_session(&mut session, run_id, "token_threshold")
                .await;
        }

        let final_content = match outcome.final_content {
            Some(content) if !content.trim().is_empty() => content,
            _ => return Ok(None),
        };
        tracing::info!(
            run_id,
            preview = %preview(&final_content, 120),
            "response ready"
        );
        Ok(Some(
            OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), final_content)
                .with_reply_to(msg.message_id()),
        ))
    }

    /// System-channel messages (heartbeats, scheduled prompts) route their
    /// reply back through `origin_channel:origin_chat_id` packed in chat_id.
    async fn process_system_message(
        &self,
        msg: &InboundMessage,
        run_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        tracing::info!(run_id, sender = %msg.sender_id, "processing system message");

        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((channel, chat_id)) => (channel.to_owned(), chat_id.to_owned()),
            None => ("cli".to_owned(), msg.chat_id.clone()),
        };
        let session_key = msg.session_key();
        let session_key = if session_key == format!("system:{}", msg.chat_id) {
            format!("{origin_channel}:{origin_chat_id}")
        } else {
            session_key
        };

        let mut session = self.inner.sessions.get_or_create(&session_key);
        if self.inner.sessions.apply_idle_reset(&mut session) {
            self.inner.emitter.emit(
                AgentEvent::new(EventPayload::SessionIdleReset, run_id, &session_key)
                    .with_route(origin_channel.clone(), origin_chat_id.clone()),
            );
        }

        let model_override = msg.model_override();
        let reduced_iterations = self.inner.agent.max_iterations.min(12);
        let outcome = self
            .run_dialog(
                &mut session,
                &msg.content,
                &origin_channel,
                &origin_chat_id,
                &msg.sender_id,
                &[],
                run_id,
                None,
                Some(reduced_iterations),
                model_override.as_deref(),
            )
            .await?;

        session.add_message("user", format!("[System: {}] {}", msg.sender_id, msg.content));
        if let Some(final_content) = &outcome.final_content {
            if !final_content.trim().is_empty() {
                session.add_message("assistant", final_content.clone());
            }
        }
        if let Err(e) = self.inner.sessions.save(&session) {
            tracing::warn!(session_key = %session.key, error = %e, "failed to save session");
        }

        self.update_run(run_id, |run| {
            run.model = model_override
                .clone()
                .unwrap_or_else(|| self.inner.model.clone());
            run.usage_prompt_tokens = outcome.usage.prompt_tokens;
            run.usage_completion_tokens = outcome.usage.completion_tokens;
            run.usage_total_tokens = outcome.usage.total_tokens;
        });

        match outcome.final_content {
            Some(content) if !content.trim().is_empty() => Ok(Some(OutboundMessage::new(
                origin_channel,
                origin_chat_id,
                content,
            ))),
            _ => Ok(None),
        }
    }

    // ── Session-control commands ───────────────────────────────────

    fn handle_session_command(
        &self,
        msg: &InboundMessage,
        run_id: &str,
        session: &mut Session,
    ) -> Option<OutboundMessage> {
        let (command, arg) = split_slash_command(&msg.content)?;
        let reply = |content: String| {
            Some(
                OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), content)
                    .with_reply_to(msg.message_id()),
            )
        };

        match command.as_str() {
            "/cancel" => {
                let session_key = msg.session_key();
                let mut candidates: Vec<RunState> = self
                    .inner
                    .active_runs
                    .lock()
                    .values()
                    .filter(|run| {
                        run.session_key == session_key
                            && run.run_id != run_id
                            && matches!(run.status, RunStatus::Queued | RunStatus::Running)
                    })
                    .cloned()
                    .collect();
                if candidates.is_empty() {
                    return reply("No active run to cancel for this session.".into());
                }
                candidates.sort_by_key(|run| {
                    (run.status != RunStatus::Running, run.created_at)
                });
                let target = &candidates[0];
                if self.cancel_run(&target.run_id) {
                    reply(format!("Cancelled run `{}`.", target.run_id))
                } else {
                    reply(format!("Run `{}` is no longer cancellable.", target.run_id))
                }
            }
            "/status" => {
                let session_key = msg.session_key();
                let active = self.inner.active_runs.lock();
                let total = active
                    .values()
                    .filter(|run| matches!(run.status, RunStatus::Queued | RunStatus::Running))
                    .count();
                let on_session = active
                    .values()
                    .filter(|run| {
                        run.session_key == session_key
                            && run.run_id != run_id
                            && matches!(run.status, RunStatus::Queued | RunStatus::Running)
                    })
                    .count();
                drop(active);
                let thinking = session
                    .thinking_mode()
                    .unwrap_or_else(|| "default".to_owned());
                reply(format!(
                    "Model: {}\nThinking: {}\nQueue mode: {}\nActive runs (session): {}\nActive runs (total): {}",
                    self.inner.model,
                    thinking,
                    self.inner.queue.mode.as_str(),
                    on_session,
                    total,
                ))
            }
            "/reset" => {
                session.clear();
                session.summary.clear();
                session.metadata = serde_json::Map::new();
                if let Err(e) = self.inner.sessions.save(session) {
                    tracing::warn!(error = %e, "failed to save reset session");
                }
                reply("Session reset.".into())
            }
            "/think" => {
                if arg.is_empty() {
                    let mode = session
                        .thinking_mode()
                        .unwrap_or_else(|| "default".to_owned());
                    return reply(format!("Current thinking mode: {mode}."));
                }
                let mode = arg.split_whitespace().next().unwrap_or("");
                match ThinkingMode::parse(mode) {
                    Some(mode) => {
                        session.metadata.insert(
                            "thinking_mode".into(),
                            serde_json::Value::String(mode.as_str().into()),
                        );
                        if let Err(e) = self.inner.sessions.save(session) {
                            tracing::warn!(error = %e, "failed to save thinking mode");
                        }
                        reply(format!("Thinking mode set to {}.", mode.as_str()))
                    }
                    None => reply("Usage: /think off|low|medium|high".into()),
                }
            }
            other => {
                // `/think:<mode>` used standalone acts as a setter.
                if let Some(mode) = other.strip_prefix("/think:") {
                    if arg.is_empty() {
                        return match ThinkingMode::parse(mode) {
                            Some(mode) => {
                                session.metadata.insert(
                                    "thinking_mode".into(),
                                    serde_json::Value::String(mode.as_str().into()),
                                );
                                if let Err(e) = self.inner.sessions.save(session) {
                                    tracing::warn!(error = %e, "failed to save thinking mode");
                                }
                                reply(format!("Thinking mode set to {}.", mode.as_str()))
                            }
                            None => reply("Usage: /think off|low|medium|high".into()),
                        };
                    }
                }
                None
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    Replace,
    Collect,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command parsing helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn split_slash_command(content: &str) -> Option<(String, String)> {
    let text = content.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next()?.split('@').next()?.to_lowercase();
    let arg = parts.next().unwrap_or("").trim().to_owned();
    Some((command, arg))
}

pub(crate) fn is_cancel_command(content: &str) -> bool {
    matches!(split_slash_command(content), Some((command, _)) if command == "/cancel")
}

pub(crate) fn is_session_control_command(content: &str) -> bool {
    match split_slash_command(content) {
        Some((command, _)) => {
            matches!(command.as_str(), "/cancel" | "/status" | "/reset" | "/think")
                || command.starts_with("/think:")
        }
        None => false,
    }
}

/// Strip a leading `/think:<mode>` from a normal message, returning the
/// override and the remaining text.
fn strip_think_prefix(content: &str) -> Option<(Option<ThinkingMode>, String)> {
    let trimmed = content.trim_start();
    let rest = trimmed.strip_prefix("/think:")?;
    let mode_end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    let mode = ThinkingMode::parse(&rest[..mode_end])?;
    let remainder = rest[mode_end..].trim_start().to_owned();
    Some((Some(mode), remainder))
}

pub(crate) fn supports_typing_control(channel: &str) -> bool {
    matches!(channel, "telegram" | "whatsapp")
}

/// Push the routing context to every context-aware tool before a turn.
pub(crate) fn tool_context_for(
    channel: &str,
    chat_id: &str,
    sender_id: &str,
    run_id: &str,
    session_key: &str,
) -> ToolContext {
    ToolContext {
        channel: channel.to_owned(),
        chat_id: chat_id.to_owned(),
        session_key: session_key.to_owned(),
        user_key: sender_id.to_owned(),
        run_id: run_id.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_command_parsing() {
        assert_eq!(
            split_slash_command("/cancel"),
            Some(("/cancel".into(), String::new()))
        );
        assert_eq!(
            split_slash_command("/think high"),
            Some(("/think".into(), "high".into()))
        );
        assert_eq!(
            split_slash_command("/status@courier_bot now"),
            Some(("/status".into(), "now".into()))
        );
        assert_eq!(split_slash_command("hello"), None);
    }

    #[test]
    fn control_command_detection() {
        assert!(is_session_control_command("/cancel"));
        assert!(is_session_control_command("/think:high"));
        assert!(is_session_control_command("/reset"));
        assert!(!is_session_control_command("/unknown"));
        assert!(!is_session_control_command("plain text"));
        assert!(is_cancel_command("/cancel"));
        assert!(!is_cancel_command("/status"));
    }

    #[test]
    fn think_prefix_stripping() {
        let (mode, rest) = strip_think_prefix("/think:high plan the trip").unwrap();
        assert_eq!(mode, Some(ThinkingMode::High));
        assert_eq!(rest, "plan the trip");

        assert!(strip_think_prefix("/think:warp do it").is_none());
        assert!(strip_think_prefix("normal message").is_none());
    }

    #[test]
    fn typing_control_channels() {
        assert!(supports_typing_control("telegram"));
        assert!(supports_typing_control("whatsapp"));
        assert!(!supports_typing_control("cli"));
    }
}
