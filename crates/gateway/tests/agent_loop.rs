//! End-to-end agent loop scenarios over a scripted provider: queue modes,
//! per-session serialization, steering, cancellation, timeouts, overload
//! compaction retry, and reply shaping.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use courier_domain::config::{Config, QueueMode};
use courier_domain::event::AgentEvent;
use courier_domain::message::{InboundMessage, OutboundMessage};
use courier_gateway::bus::MessageBus;
use courier_gateway::runtime::AgentLoop;
use courier_gateway::state::AgentDeps;
use courier_providers::mock::{ScriptedProvider, ScriptedReply};
use courier_providers::LlmProvider;
use courier_sessions::RunStatus;

struct Harness {
    agent: AgentLoop,
    bus: Arc<MessageBus>,
    provider: Arc<ScriptedProvider>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    _dir: TempDir,
}

fn harness(replies: Vec<ScriptedReply>, configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::create_dir_all(&data_dir).unwrap();

    let mut config = Config::default();
    config.agent.timeout_seconds = 10;
    configure(&mut config);

    let provider = Arc::new(ScriptedProvider::new("scripted").with_replies(replies));
    let bus = Arc::new(MessageBus::new());
    let events = bus.register_run_listener();

    let agent = AgentLoop::new(AgentDeps {
        config,
        workspace,
        data_dir,
        bus: bus.clone(),
        provider: provider.clone() as Arc<dyn LlmProvider>,
        rate_limiter: None,
        audit: None,
        usage: None,
    });

    Harness {
        agent,
        bus,
        provider,
        events,
        _dir: dir,
    }
}

fn msg(content: &str) -> InboundMessage {
    InboundMessage::new("telegram", "alice", "42", content)
}

async fn next_outbound(bus: &MessageBus) -> OutboundMessage {
    loop {
        let out = tokio::time::timeout(Duration::from_secs(5), bus.consume_outbound())
            .await
            .expect("timed out waiting for outbound")
            .expect("bus closed");
        if out.control.is_none() {
            return out;
        }
    }
}

/// Wait until a run observed by `get_run` satisfies the predicate.
async fn wait_for_run(
    agent: &AgentLoop,
    run_id: &str,
    pred: impl Fn(&courier_sessions::RunState) -> bool,
) -> courier_sessions::RunState {
    for _ in 0..200 {
        if let Some(run) = agent.get_run(run_id) {
            if pred(&run) {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached the expected state");
}

/// Drain events until the given run id reports a terminal lifecycle event.
async fn drain_until_terminal(
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    run_id: &str,
) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed");
        let is_terminal = event.run_id == run_id && event.payload.is_terminal();
        out.push(event);
        if is_terminal {
            return out;
        }
    }
}

fn events_of_type<'a>(events: &'a [AgentEvent], type_name: &str) -> Vec<&'a AgentEvent> {
    events
        .iter()
        .filter(|e| e.payload.type_name() == type_name)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn steer_mode_merges_mid_run_message() {
    let mut h = harness(
        vec![ScriptedReply::text("scripted reply one").with_delay(Duration::from_millis(300))],
        |config| config.queue.mode = QueueMode::Steer,
    );

    let run1 = h.agent.submit_inbound(msg("m1: original request"), true);
    wait_for_run(&h.agent, &run1, |run| run.status == RunStatus::Running).await;

    let run2 = h
        .agent
        .submit_inbound(msg("m2: actually make it shorter"), true);
    assert_eq!(run2, run1, "steered message must join the running run");

    let out = next_outbound(&h.bus).await;
    assert_eq!(out.content, "scripted reply one");

    let events = drain_until_terminal(&mut h.events, &run1).await;
    assert_eq!(events_of_type(&events, "run_start").len(), 1);
    assert_eq!(events_of_type(&events, "run_end").len(), 1);
    let steer = events_of_type(&events, "run_steer");
    assert_eq!(steer.len(), 1);
    match &steer[0].payload {
        courier_domain::event::EventPayload::RunSteer {
            instruction_preview,
            source,
            ..
        } => {
            assert!(instruction_preview.starts_with("m2: actually make it shorter"));
            assert_eq!(source, "inbound");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn queue_mode_serializes_per_session() {
    let mut h = harness(
        vec![
            ScriptedReply::text("first reply").with_delay(Duration::from_millis(100)),
            ScriptedReply::text("second reply").with_delay(Duration::from_millis(100)),
        ],
        |_| {},
    );

    let run1 = h.agent.submit_inbound(msg("m1"), true);
    wait_for_run(&h.agent, &run1, |run| run.status == RunStatus::Running).await;
    let run2 = h.agent.submit_inbound(msg("m2"), true);
    assert_ne!(run1, run2);

    let _ = next_outbound(&h.bus).await;
    let _ = next_outbound(&h.bus).await;

    let mut events = drain_until_terminal(&mut h.events, &run1).await;
    events.extend(drain_until_terminal(&mut h.events, &run2).await);

    let starts = events_of_type(&events, "run_start");
    let ends = events_of_type(&events, "run_end");
    assert_eq!(starts.len(), 2);
    assert_eq!(ends.len(), 2);

    // Serialization: the second run starts only after the first ended.
    let first_end = ends.iter().find(|e| e.run_id == run1).unwrap();
    let second_start = starts.iter().find(|e| e.run_id == run2).unwrap();
    assert!(second_start.ts >= first_end.ts);
}

#[tokio::test]
async fn collect_mode_merges_queued_followup() {
    let mut h = harness(
        vec![
            ScriptedReply::text("blocker done").with_delay(Duration::from_millis(300)),
            ScriptedReply::text("merged reply"),
        ],
        |config| config.queue.mode = QueueMode::Collect,
    );

    // Occupy the session so the next messages stay queued.
    let blocker = h.agent.submit_inbound(msg("m0: long running"), true);
    wait_for_run(&h.agent, &blocker, |run| run.status == RunStatus::Running).await;

    let queued = h.agent.submit_inbound(msg("m1: first draft"), true);
    let merged = h.agent.submit_inbound(msg("m2: one more thing"), true);
    assert_eq!(merged, queued, "collect must merge into the queued run");

    // Both replies drain.
    let _ = next_outbound(&h.bus).await;
    let _ = next_outbound(&h.bus).await;
    let mut events = drain_until_terminal(&mut h.events, &blocker).await;
    events.extend(drain_until_terminal(&mut h.events, &queued).await);

    let updates = events_of_type(&events, "queue_update");
    assert!(!updates.is_empty());

    // The merged run's user content carries the collect marker.
    let requests = h.provider.requests();
    let merged_request = &requests[1];
    let user_text = merged_request
        .messages
        .last()
        .unwrap()
        .content
        .as_text();
    assert!(user_text.contains("m1: first draft"));
    assert!(user_text.contains("[Collected Followup]\nm2: one more thing"));
}

#[tokio::test]
async fn followup_mode_replaces_queued_draft() {
    let mut h = harness(
        vec![
            ScriptedReply::text("blocker done").with_delay(Duration::from_millis(300)),
            ScriptedReply::text("final reply"),
        ],
        |config| config.queue.mode = QueueMode::Followup,
    );

    let blocker = h.agent.submit_inbound(msg("m0: long running"), true);
    wait_for_run(&h.agent, &blocker, |run| run.status == RunStatus::Running).await;

    let queued = h.agent.submit_inbound(msg("m1: first draft"), true);
    let replaced = h.agent.submit_inbound(msg("m2: replacement"), true);
    assert_eq!(replaced, queued);

    let _ = next_outbound(&h.bus).await;
    let _ = next_outbound(&h.bus).await;
    let _ = drain_until_terminal(&mut h.events, &queued).await;

    let requests = h.provider.requests();
    let user_text = requests[1].messages.last().unwrap().content.as_text();
    assert!(user_text.contains("m2: replacement"));
    assert!(!user_text.contains("m1: first draft"));
}

#[tokio::test]
async fn backlog_overflow_replaces_oldest_queued() {
    let mut h = harness(
        vec![
            ScriptedReply::text("blocker done").with_delay(Duration::from_millis(300)),
            ScriptedReply::text("queued reply"),
        ],
        |config| config.queue.max_backlog = 1,
    );

    let blocker = h.agent.submit_inbound(msg("m0: long running"), true);
    wait_for_run(&h.agent, &blocker, |run| run.status == RunStatus::Running).await;

    let queued = h.agent.submit_inbound(msg("m1: queued draft"), true);
    let overflow = h.agent.submit_inbound(msg("m2: overflow message"), true);
    assert_eq!(overflow, queued, "overflow must reuse the queued run");

    // Backlog invariant: never more than max_backlog queued.
    let snapshot = h.agent.queue_snapshot();
    let session = snapshot
        .sessions
        .iter()
        .find(|s| s.session_key == "telegram:42")
        .unwrap();
    assert!(session.queued.len() <= 1);

    let _ = next_outbound(&h.bus).await;
    let _ = next_outbound(&h.bus).await;
    let mut events = drain_until_terminal(&mut h.events, &blocker).await;
    events.extend(drain_until_terminal(&mut h.events, &queued).await);

    let overflow_updates: Vec<_> = events_of_type(&events, "queue_update")
        .into_iter()
        .filter(|e| {
            matches!(
                &e.payload,
                courier_domain::event::EventPayload::QueueUpdate { reason, .. }
                    if reason == "overflow_replace"
            )
        })
        .collect();
    assert_eq!(overflow_updates.len(), 1);

    let requests = h.provider.requests();
    let user_text = requests[1].messages.last().unwrap().content.as_text();
    assert!(user_text.contains("m2: overflow message"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeouts, errors, cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn run_timeout_produces_clean_error() {
    let mut h = harness(
        vec![ScriptedReply::text("too slow").with_delay(Duration::from_millis(1500))],
        |config| config.agent.timeout_seconds = 1,
    );

    let run_id = h.agent.submit_inbound(msg("m1"), true);
    let out = next_outbound(&h.bus).await;
    assert!(out.content.contains("timed out"));

    let events = drain_until_terminal(&mut h.events, &run_id).await;
    assert_eq!(events_of_type(&events, "run_error").len(), 1);

    let archived = h.agent.get_run(&run_id).unwrap();
    assert_eq!(archived.status, RunStatus::Error);
    assert!(archived.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn cancel_command_bypasses_session_lock() {
    let mut h = harness(
        vec![ScriptedReply::text("never delivered").with_delay(Duration::from_millis(2000))],
        |_| {},
    );

    let run_id = h.agent.submit_inbound(msg("m1: long task"), true);
    wait_for_run(&h.agent, &run_id, |run| run.status == RunStatus::Running).await;

    // The /cancel command must start (and finish) while m1 still holds the
    // session lock.
    let cancel_run = h.agent.submit_inbound(msg("/cancel"), true);
    assert_ne!(cancel_run, run_id);

    let out = next_outbound(&h.bus).await;
    assert!(out.content.contains("Cancelled run"), "got: {}", out.content);
    assert!(out.content.contains(&run_id));

    let events = drain_until_terminal(&mut h.events, &run_id).await;
    assert_eq!(events_of_type(&events, "run_cancelled").len(), 1);

    let archived = wait_for_run(&h.agent, &run_id, |run| run.status.is_terminal()).await;
    assert_eq!(archived.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn queued_run_cancels_without_acquiring_lock() {
    let mut h = harness(
        vec![
            ScriptedReply::text("blocker done").with_delay(Duration::from_millis(400)),
        ],
        |_| {},
    );

    let blocker = h.agent.submit_inbound(msg("m0"), true);
    wait_for_run(&h.agent, &blocker, |run| run.status == RunStatus::Running).await;
    let queued = h.agent.submit_inbound(msg("m1: will be cancelled"), true);

    assert!(h.agent.cancel_run(&queued));
    let archived = wait_for_run(&h.agent, &queued, |run| run.status.is_terminal()).await;
    assert_eq!(archived.status, RunStatus::Cancelled);

    // Only the blocker ever produced provider traffic.
    let _ = next_outbound(&h.bus).await;
    let _ = drain_until_terminal(&mut h.events, &blocker).await;
    assert_eq!(h.provider.call_count(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Overload retry & compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn overload_triggers_single_compaction_retry() {
    let mut h = harness(
        vec![
            ScriptedReply::overloaded(),
            ScriptedReply::text("summary of the earlier conversation"),
            ScriptedReply::text("after retry"),
        ],
        |_| {},
    );

    // Seed enough history for the compactor to have something to fold.
    {
        let sessions = h.agent.sessions();
        let mut session = sessions.get_or_create("telegram:42");
        for i in 0..14 {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            session.add_message(role, format!("earlier message {i}"));
        }
        sessions.save(&session).unwrap();
    }

    let run_id = h.agent.submit_inbound(msg("m1: please continue"), true);
    let out = next_outbound(&h.bus).await;
    assert_eq!(out.content, "after retry");

    let events = drain_until_terminal(&mut h.events, &run_id).await;
    let compaction_starts = events_of_type(&events, "compaction_start");
    assert_eq!(compaction_starts.len(), 1);
    match &compaction_starts[0].payload {
        courier_domain::event::EventPayload::CompactionStart { reason, .. } => {
            assert_eq!(reason, "overloaded_retry");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(events_of_type(&events, "compaction_end").len(), 1);

    // Exactly one assistant delta: the post-retry content fits one chunk.
    let deltas = events_of_type(&events, "assistant_delta");
    assert_eq!(deltas.len(), 1);
    match &deltas[0].payload {
        courier_domain::event::EventPayload::AssistantDelta { delta, index } => {
            assert_eq!(delta, "after retry");
            assert_eq!(*index, 0);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // The session now carries the compaction summary.
    let session = h.agent.sessions().get_or_create("telegram:42");
    assert_eq!(session.summary, "summary of the earlier conversation");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch & steering inside the dialog loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn steer_instruction_is_injected_before_next_llm_call() {
    let mut h = harness(
        vec![
            ScriptedReply::tool_call("tc_1", "list_dir", json!({"path": "."}))
                .with_delay(Duration::from_millis(250)),
            ScriptedReply::text("done with listing"),
        ],
        |config| config.queue.mode = QueueMode::Steer,
    );

    let run_id = h.agent.submit_inbound(msg("m1: look around"), true);
    wait_for_run(&h.agent, &run_id, |run| run.status == RunStatus::Running).await;
    let steered = h.agent.submit_inbound(msg("m2: only markdown files"), true);
    assert_eq!(steered, run_id);

    let out = next_outbound(&h.bus).await;
    assert_eq!(out.content, "done with listing");

    let events = drain_until_terminal(&mut h.events, &run_id).await;
    assert_eq!(events_of_type(&events, "tool_start").len(), 1);
    assert_eq!(events_of_type(&events, "tool_end").len(), 1);
    assert_eq!(events_of_type(&events, "run_steer_applied").len(), 1);

    // The steer text was injected as a user message before the second call.
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    let steer_msg = requests[1]
        .messages
        .iter()
        .map(|m| m.content.as_text())
        .find(|text| text.contains("steer update received during run"));
    let steer_msg = steer_msg.expect("steer message missing from second request");
    assert!(steer_msg.contains("1. (inbound) m2: only markdown files"));
}

#[tokio::test]
async fn message_tool_confirmation_is_suppressed() {
    let mut h = harness(
        vec![
            ScriptedReply::tool_call(
                "tc_1",
                "message",
                json!({"content": "here is your update"}),
            ),
            ScriptedReply::text("Message sent."),
        ],
        |_| {},
    );

    let run_id = h.agent.submit_inbound(msg("m1: notify me"), true);

    // The only outbound is the message-tool send; the trailing "Message
    // sent." confirmation is suppressed.
    let out = next_outbound(&h.bus).await;
    assert_eq!(out.content, "here is your update");

    let events = drain_until_terminal(&mut h.events, &run_id).await;
    let ends = events_of_type(&events, "run_end");
    assert_eq!(ends.len(), 1);
    match &ends[0].payload {
        courier_domain::event::EventPayload::RunEnd { has_response, .. } => {
            assert!(!has_response, "confirmation should be suppressed");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn no_reply_token_suppresses_outbound() {
    let mut h = harness(vec![ScriptedReply::text("NO_REPLY")], |_| {});

    let run_id = h.agent.submit_inbound(msg("m1: heartbeat"), true);
    let events = drain_until_terminal(&mut h.events, &run_id).await;
    let ends = events_of_type(&events, "run_end");
    match &ends[0].payload {
        courier_domain::event::EventPayload::RunEnd { has_response, .. } => {
            assert!(!has_response);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // Nothing lands on the outbound queue.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), next_outbound(&h.bus))
            .await
            .is_err()
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session-control commands & persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn session_history_persists_across_runs() {
    let h = harness(
        vec![
            ScriptedReply::text("first answer"),
            ScriptedReply::text("second answer"),
        ],
        |_| {},
    );

    let reply = h
        .agent
        .process_direct("first question", "cli:direct", "cli", "direct", None)
        .await;
    assert_eq!(reply, "first answer");
    let reply = h
        .agent
        .process_direct("second question", "cli:direct", "cli", "direct", None)
        .await;
    assert_eq!(reply, "second answer");

    let session = h.agent.sessions().get_or_create("cli:direct");
    let contents: Vec<&str> = session
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        contents,
        vec![
            "first question",
            "first answer",
            "second question",
            "second answer"
        ]
    );
    // The archived run snapshot is stamped onto the session metadata.
    assert!(session.metadata.get("last_run_id").is_some());

    // The second request included the first exchange as history.
    let requests = h.provider.requests();
    let history_text: Vec<String> = requests[1]
        .messages
        .iter()
        .map(|m| m.content.as_text())
        .collect();
    assert!(history_text.iter().any(|t| t == "first question"));
    assert!(history_text.iter().any(|t| t == "first answer"));
}

#[tokio::test]
async fn reset_and_think_commands() {
    let h = harness(vec![ScriptedReply::text("answer")], |_| {});

    let reply = h
        .agent
        .process_direct("remember this", "cli:direct", "cli", "direct", None)
        .await;
    assert_eq!(reply, "answer");

    let reply = h
        .agent
        .process_direct("/think high", "cli:direct", "cli", "direct", None)
        .await;
    assert_eq!(reply, "Thinking mode set to high.");
    let session = h.agent.sessions().get_or_create("cli:direct");
    assert_eq!(session.thinking_mode().as_deref(), Some("high"));

    let reply = h
        .agent
        .process_direct("/reset", "cli:direct", "cli", "direct", None)
        .await;
    assert_eq!(reply, "Session reset.");
    let session = h.agent.sessions().get_or_create("cli:direct");
    assert!(session.messages.is_empty());
    assert!(session.summary.is_empty());

    let reply = h
        .agent
        .process_direct("/status", "cli:direct", "cli", "direct", None)
        .await;
    assert!(reply.contains("Model:"));
    assert!(reply.contains("Active runs"));

    let reply = h
        .agent
        .process_direct("/cancel", "cli:direct", "cli", "direct", None)
        .await;
    assert_eq!(reply, "No active run to cancel for this session.");
}

#[tokio::test]
async fn usage_totals_recorded_on_run() {
    let mut h = harness(
        vec![ScriptedReply::text("counted reply").with_usage(120, 30)],
        |_| {},
    );

    let run_id = h.agent.submit_inbound(msg("m1"), true);
    let _ = next_outbound(&h.bus).await;
    let _ = drain_until_terminal(&mut h.events, &run_id).await;

    let archived = wait_for_run(&h.agent, &run_id, |run| run.status.is_terminal()).await;
    assert_eq!(archived.usage_prompt_tokens, 120);
    assert_eq!(archived.usage_completion_tokens, 30);
    assert_eq!(archived.usage_total_tokens, 150);
}

#[tokio::test]
async fn closed_run_suppresses_late_events() {
    let mut h = harness(vec![ScriptedReply::text("quick reply")], |_| {});

    let run_id = h.agent.submit_inbound(msg("m1"), true);
    let _ = next_outbound(&h.bus).await;
    let events = drain_until_terminal(&mut h.events, &run_id).await;
    assert_eq!(events_of_type(&events, "run_end").len(), 1);

    // A late steer attempt on the closed run is refused and emits nothing.
    assert!(!h.agent.steer_run(&run_id, "too late"));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), h.events.recv())
            .await
            .is_err()
    );
}
