//! Runtime alerting.
//!
//! Collects dedupe-windowed alerts from the run-event stream (backlog
//! overflow) and periodic health scans (dead distributed nodes, sessions at
//! backlog capacity). Alerts are held in a bounded ring for the dashboard;
//! targets are resolved from the configured rules.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use courier_domain::config::AlertsConfig;
use courier_domain::event::{now_ts, AgentEvent, EventPayload};

use crate::distributed::DistributedManager;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub event: String,
    pub severity: String,
    pub message: String,
    pub created_at_ms: i64,
    pub targets: Vec<String>,
    pub metadata: Map<String, Value>,
}

pub struct AlertService {
    enabled: bool,
    config: AlertsConfig,
    dedupe_window: Duration,
    max_events: usize,
    events: Mutex<VecDeque<Alert>>,
    dedupe: Mutex<HashMap<String, Instant>>,
}

impl AlertService {
    pub fn new(config: AlertsConfig, dedupe_window_s: u64, max_events: usize) -> Self {
        Self {
            enabled: config.enabled,
            config,
            dedupe_window: Duration::from_secs(dedupe_window_s.max(1)),
            max_events: max_events.max(10),
            events: Mutex::new(VecDeque::new()),
            dedupe: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Emit an alert unless an identical dedupe key fired within the window.
    pub fn emit(
        &self,
        event: &str,
        severity: &str,
        message: &str,
        dedupe_key: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Option<Alert> {
        if !self.enabled {
            return None;
        }
        let key = dedupe_key
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{event}:{message}"));
        {
            let mut dedupe = self.dedupe.lock();
            let now = Instant::now();
            if let Some(last) = dedupe.get(&key) {
                if now.duration_since(*last) < self.dedupe_window {
                    return None;
                }
            }
            dedupe.insert(key, now);
        }

        let alert = Alert {
            id: format!("alert_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            event: event.to_owned(),
            severity: severity.to_owned(),
            message: message.to_owned(),
            created_at_ms: (now_ts() * 1000.0) as i64,
            targets: self.targets_for_event(event),
            metadata,
        };
        let mut events = self.events.lock();
        events.push_front(alert.clone());
        while events.len() > self.max_events {
            events.pop_back();
        }
        Some(alert)
    }

    pub fn list_events(&self, limit: usize) -> Vec<Alert> {
        let cap = limit.clamp(1, self.max_events);
        self.events.lock().iter().take(cap).cloned().collect()
    }

    pub fn summary(&self) -> Value {
        let events = self.events.lock();
        let mut by_event: HashMap<String, usize> = HashMap::new();
        for alert in events.iter() {
            *by_event.entry(alert.event.clone()).or_default() += 1;
        }
        serde_json::json!({
            "enabled": self.enabled,
            "total": events.len(),
            "by_event": by_event,
        })
    }

    // ── Sources ────────────────────────────────────────────────────

    /// Feed one run event through the alert rules.
    pub fn observe_run_event(&self, event: &AgentEvent) {
        if let EventPayload::QueueUpdate { reason, .. } = &event.payload {
            if reason == "overflow_replace" {
                let mut metadata = Map::new();
                metadata.insert(
                    "session_key".into(),
                    Value::String(event.session_key.clone()),
                );
                metadata.insert("run_id".into(), Value::String(event.run_id.clone()));
                self.emit(
                    "backlog_overflow",
                    "warn",
                    "Queue backlog overflow replaced an older queued run.",
                    Some(&format!("backlog_overflow:{}", event.session_key)),
                    metadata,
                );
            }
        }
    }

    /// Health scan: distributed nodes that missed their heartbeat.
    pub fn scan_distributed(&self, manager: &DistributedManager) {
        for node in manager.list_nodes(true) {
            if node.alive {
                continue;
            }
            let mut metadata = Map::new();
            metadata.insert("node_id".into(), Value::String(node.node_id.clone()));
            metadata.insert(
                "last_heartbeat_ms".into(),
                Value::Number(node.last_heartbeat_ms.into()),
            );
            self.emit(
                "node_failure",
                "error",
                &format!("Distributed node '{}' missed heartbeat.", node.node_id),
                Some(&format!(
                    "node_failure:{}:{}",
                    node.node_id, node.last_heartbeat_ms
                )),
                metadata,
            );
        }
    }

    /// Health scan: sessions whose queue backlog reached capacity.
    pub fn scan_queue(&self, sessions: &[(String, usize)], max_backlog: usize) {
        if max_backlog == 0 {
            return;
        }
        for (session_key, queued) in sessions {
            if *queued < max_backlog {
                continue;
            }
            let mut metadata = Map::new();
            metadata.insert("session_key".into(), Value::String(session_key.clone()));
            metadata.insert("queued".into(), Value::Number((*queued).into()));
            metadata.insert("max_backlog".into(), Value::Number(max_backlog.into()));
            self.emit(
                "backlog_overflow",
                "warn",
                &format!("Session '{session_key}' reached queue backlog capacity."),
                Some(&format!("backlog_capacity:{session_key}")),
                metadata,
            );
        }
    }

    fn targets_for_event(&self, event_name: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .config
            .rules
            .iter()
            .filter(|rule| rule.event == "*" || rule.event == event_name)
            .flat_map(|rule| rule.channels.iter())
            .filter_map(|alias| {
                let alias = alias.trim();
                if alias.is_empty() {
                    return None;
                }
                Some(
                    self.config
                        .channels
                        .get(alias)
                        .cloned()
                        .unwrap_or_else(|| alias.to_owned()),
                )
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
