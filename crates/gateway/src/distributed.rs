//! Distributed node registration and task dispatch.
//!
//! Best-effort fleet tracking, not consensus: all state lives in one JSON
//! file guarded by a process mutex plus an advisory file lock, so several
//! gateway processes on one host share a consistent view. Every mutation is
//! a read-modify-write under both locks.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use courier_domain::config::DistributedConfig;
use courier_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedNode {
    pub node_id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub address: String,
    pub status: String,
    pub registered_at_ms: i64,
    pub updated_at_ms: i64,
    pub last_heartbeat_ms: i64,
    /// Derived at read time: heartbeat within the timeout window.
    #[serde(default)]
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedTask {
    pub task_id: String,
    pub kind: String,
    pub payload: Value,
    pub required_capabilities: Vec<String>,
    pub assigned_node_id: String,
    pub status: TaskStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub claimed_at_ms: Option<i64>,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    nodes: HashMap<String, DistributedNode>,
    #[serde(default)]
    tasks: HashMap<String, DistributedTask>,
}

pub struct DistributedManager {
    store_path: PathBuf,
    lock_path: PathBuf,
    local_node_id: String,
    peer_allowlist: BTreeSet<String>,
    heartbeat_timeout_ms: i64,
    max_tasks: usize,
    guard: Mutex<()>,
}

impl DistributedManager {
    pub fn new(store_path: &Path, config: &DistributedConfig) -> Self {
        if let Some(parent) = store_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let mut lock_name = store_path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        Self {
            store_path: store_path.to_path_buf(),
            lock_path: store_path.with_file_name(lock_name),
            local_node_id: if config.node_id.trim().is_empty() {
                "local-node".into()
            } else {
                config.node_id.trim().to_owned()
            },
            peer_allowlist: config
                .peer_allowlist
                .iter()
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect(),
            heartbeat_timeout_ms: (config.heartbeat_timeout_s.max(15) * 1000) as i64,
            max_tasks: config.max_tasks.max(100),
            guard: Mutex::new(()),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn enforce_allowlist(&self, node_id: &str) -> Result<()> {
        if self.peer_allowlist.is_empty() || node_id == self.local_node_id {
            return Ok(());
        }
        if !self.peer_allowlist.contains(node_id) {
            return Err(Error::Other(format!(
                "Node '{node_id}' is not in distributed.peer_allowlist."
            )));
        }
        Ok(())
    }

    fn load(&self) -> State {
        fs::read_to_string(&self.store_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, state: &State) {
        let payload = match serde_json::to_string_pretty(state) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize distributed state");
                return;
            }
        };
        let tmp = self.store_path.with_extension("json.tmp");
        let result = fs::write(&tmp, payload).and_then(|_| fs::rename(&tmp, &self.store_path));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist distributed state");
            let _ = fs::remove_file(&tmp);
        }
    }

    fn file_lock(&self) -> Option<fs::File> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .ok()?;
        if let Err(e) = file.lock_exclusive() {
            tracing::debug!(error = %e, "distributed file lock unavailable");
        }
        Some(file)
    }

    /// Run a read-modify-write transaction under both locks.
    fn with_state<T>(&self, write: bool, f: impl FnOnce(&mut State) -> T) -> T {
        let _guard = self.guard.lock();
        let _file_lock = self.file_lock();
        let mut state = self.load();
        let out = f(&mut state);
        if write {
            self.save(&state);
        }
        out
    }

    fn normalize_capabilities(capabilities: &[String]) -> Vec<String> {
        let set: BTreeSet<String> = capabilities
            .iter()
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .collect();
        set.into_iter().collect()
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn register_node(
        &self,
        node_id: &str,
        capabilities: &[String],
        metadata: Map<String, Value>,
        address: &str,
    ) -> Result<DistributedNode> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(Error::Other("node_id is required.".into()));
        }
        self.enforce_allowlist(node_id)?;

        let now = Self::now_ms();
        Ok(self.with_state(true, |state| {
            let existing = state.nodes.get(node_id);
            let node = DistributedNode {
                node_id: node_id.to_owned(),
                capabilities: Self::normalize_capabilities(capabilities),
                metadata: if metadata.is_empty() {
                    existing.map(|n| n.metadata.clone()).unwrap_or_default()
                } else {
                    metadata
                },
                address: if address.is_empty() {
                    existing.map(|n| n.address.clone()).unwrap_or_default()
                } else {
                    address.to_owned()
                },
                status: "online".into(),
                registered_at_ms: existing.map(|n| n.registered_at_ms).unwrap_or(now),
                updated_at_ms: now,
                last_heartbeat_ms: now,
                alive: true,
            };
            state.nodes.insert(node_id.to_owned(), node.clone());
            node
        }))
    }

    pub fn heartbeat(
        &self,
        node_id: &str,
        capabilities: Option<&[String]>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<DistributedNode> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(Error::Other("node_id is required.".into()));
        }
        self.enforce_allowlist(node_id)?;

        let now = Self::now_ms();
        Ok(self.with_state(true, |state| {
            match state.nodes.get_mut(node_id) {
                Some(node) => {
                    if let Some(capabilities) = capabilities {
                        node.capabilities = Self::normalize_capabilities(capabilities);
                    }
                    if let Some(metadata) = metadata {
                        node.metadata = metadata;
                    }
                    node.status = "online".into();
                    node.last_heartbeat_ms = now;
                    node.updated_at_ms = now;
                    node.alive = true;
                    node.clone()
                }
                None => {
                    let node = DistributedNode {
                        node_id: node_id.to_owned(),
                        capabilities: Self::normalize_capabilities(
                            capabilities.unwrap_or_default(),
                        ),
                        metadata: metadata.unwrap_or_default(),
                        address: String::new(),
                        status: "online".into(),
                        registered_at_ms: now,
                        updated_at_ms: now,
                        last_heartbeat_ms: now,
                        alive: true,
                    };
                    state.nodes.insert(node_id.to_owned(), node.clone());
                    node
                }
            }
        }))
    }

    fn nodes_with_liveness(state: &State, timeout_ms: i64, include_stale: bool) -> Vec<DistributedNode> {
        let now = Self::now_ms();
        let mut out: Vec<DistributedNode> = state
            .nodes
            .values()
            .filter_map(|node| {
                let alive = now - node.last_heartbeat_ms <= timeout_ms;
                if alive || include_stale {
                    let mut node = node.clone();
                    node.alive = alive;
                    Some(node)
                } else {
                    None
                }
            })
            .collect();
        out.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        out
    }

    pub fn list_nodes(&self, include_stale: bool) -> Vec<DistributedNode> {
        self.with_state(false, |state| {
            Self::nodes_with_liveness(state, self.heartbeat_timeout_ms, include_stale)
        })
    }

    // ── Tasks ──────────────────────────────────────────────────────

    fn select_node(
        state: &State,
        timeout_ms: i64,
        required: &[String],
        preferred_node_id: Option<&str>,
    ) -> Option<String> {
        let required: BTreeSet<&str> = required.iter().map(String::as_str).collect();
        let covers = |node: &DistributedNode| {
            let caps: BTreeSet<&str> = node.capabilities.iter().map(String::as_str).collect();
            required.is_subset(&caps)
        };

        let alive = Self::nodes_with_liveness(state, timeout_ms, false);
        if let Some(preferred) = preferred_node_id {
            if let Some(node) = alive.iter().find(|n| n.node_id == preferred) {
                if covers(node) {
                    return Some(node.node_id.clone());
                }
            }
        }
        alive.iter().find(|n| covers(n)).map(|n| n.node_id.clone())
    }

    pub fn dispatch_task(
        &self,
        payload: Value,
        required_capabilities: &[String],
        preferred_node_id: Option<&str>,
        kind: &str,
    ) -> Result<DistributedTask> {
        let required = Self::normalize_capabilities(required_capabilities);
        self.with_state(true, |state| {
            let node_id = Self::select_node(
                state,
                self.heartbeat_timeout_ms,
                &required,
                preferred_node_id,
            )
            .ok_or_else(|| {
                Error::Other("No eligible online node available for task dispatch.".into())
            })?;

            let now = Self::now_ms();
            let task = DistributedTask {
                task_id: format!("task_{}", &uuid::Uuid::new_v4().simple().to_string()[..14]),
                kind: if kind.is_empty() { "generic" } else { kind }.to_owned(),
                payload,
                required_capabilities: required.clone(),
                assigned_node_id: node_id,
                status: TaskStatus::Queued,
                created_at_ms: now,
                updated_at_ms: now,
                claimed_at_ms: None,
                completed_at_ms: None,
                result: None,
                error: None,
            };
            state.tasks.insert(task.task_id.clone(), task.clone());
            Self::prune_tasks(&mut state.tasks, self.max_tasks);
            Ok(task)
        })
    }

    /// Claim the oldest queued task assigned to this node, moving it to
    /// running.
    pub fn claim_task(&self, node_id: &str) -> Option<DistributedTask> {
        let node_id = node_id.trim().to_owned();
        self.with_state(true, |state| {
            let oldest_id = state
                .tasks
                .values()
                .filter(|t| t.assigned_node_id == node_id && t.status == TaskStatus::Queued)
                .min_by_key(|t| t.created_at_ms)
                .map(|t| t.task_id.clone())?;
            let task = state.tasks.get_mut(&oldest_id)?;
            let now = Self::now_ms();
            task.status = TaskStatus::Running;
            task.claimed_at_ms = Some(now);
            task.updated_at_ms = now;
            Some(task.clone())
        })
    }

    pub fn complete_task(
        &self,
        task_id: &str,
        node_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<DistributedTask> {
        self.with_state(true, |state| {
            let task = state.tasks.get_mut(task_id).ok_or_else(|| {
                tracing::warn!(task_id, node_id, "task completion rejected: not found");
                Error::Other("Task not found.".into())
            })?;
            if task.assigned_node_id != node_id {
                return Err(Error::Other("Task is assigned to a different node.".into()));
            }
            let now = Self::now_ms();
            task.status = if error.is_some() {
                TaskStatus::Error
            } else {
                TaskStatus::Completed
            };
            task.error = error;
            task.result = result;
            task.completed_at_ms = Some(now);
            task.updated_at_ms = now;
            Ok(task.clone())
        })
    }

    pub fn get_task(&self, task_id: &str) -> Option<DistributedTask> {
        self.with_state(false, |state| state.tasks.get(task_id).cloned())
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        node_id: Option<&str>,
        limit: usize,
    ) -> Vec<DistributedTask> {
        self.with_state(false, |state| {
            let mut rows: Vec<DistributedTask> = state
                .tasks
                .values()
                .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
                .filter(|t| node_id.map(|n| t.assigned_node_id == n).unwrap_or(true))
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
            rows.truncate(limit.max(1));
            rows
        })
    }

    /// Keep every non-terminal task unconditionally, then the newest
    /// terminal tasks up to the cap.
    fn prune_tasks(tasks: &mut HashMap<String, DistributedTask>, max_tasks: usize) {
        if tasks.len() <= max_tasks {
            return;
        }
        let active: BTreeSet<String> = tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.task_id.clone())
            .collect();
        let mut terminal: Vec<(&String, i64)> = tasks
            .iter()
            .filter(|(_, t)| t.status.is_terminal())
            .map(|(id, t)| (id, t.updated_at_ms))
            .collect();
        terminal.sort_by(|a, b| b.1.cmp(&a.1));

        let terminal_budget = max_tasks.saturating_sub(active.len());
        let mut keep = active;
        keep.extend(terminal.iter().take(terminal_budget).map(|(id, _)| (*id).clone()));

        tasks.retain(|id, _| keep.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> DistributedManager {
        manager_with(dir, DistributedConfig::default())
    }

    fn manager_with(dir: &Path, config: DistributedConfig) -> DistributedManager {
        DistributedManager::new(&dir.join("distributed.json"), &config)
    }

    #[test]
    fn register_and_list_nodes() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.register_node("worker-1", &["shell".into(), "gpu".into()], Map::new(), "10.0.0.2")
            .unwrap();

        let nodes = mgr.list_nodes(false);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].alive);
        assert_eq!(nodes[0].capabilities, vec!["gpu", "shell"]);
        assert_eq!(nodes[0].address, "10.0.0.2");
    }

    #[test]
    fn allowlist_rejects_unknown_peers() {
        let dir = tempdir().unwrap();
        let config = DistributedConfig {
            peer_allowlist: vec!["trusted".into()],
            ..Default::default()
        };
        let mgr = manager_with(dir.path(), config);

        assert!(mgr.register_node("trusted", &[], Map::new(), "").is_ok());
        // The local node is always allowed.
        assert!(mgr.register_node("local-node", &[], Map::new(), "").is_ok());
        assert!(mgr.register_node("stranger", &[], Map::new(), "").is_err());
    }

    #[test]
    fn heartbeat_upserts_and_refreshes() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let node = mgr.heartbeat("worker-1", Some(&["shell".into()]), None).unwrap();
        assert_eq!(node.capabilities, vec!["shell"]);

        let node = mgr.heartbeat("worker-1", None, None).unwrap();
        // Capabilities untouched when not supplied.
        assert_eq!(node.capabilities, vec!["shell"]);
    }

    #[test]
    fn dispatch_matches_capabilities_and_prefers_requested_node() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.register_node("cpu-node", &["shell".into()], Map::new(), "").unwrap();
        mgr.register_node("gpu-node", &["shell".into(), "gpu".into()], Map::new(), "")
            .unwrap();

        let task = mgr
            .dispatch_task(serde_json::json!({"cmd": "train"}), &["gpu".into()], None, "generic")
            .unwrap();
        assert_eq!(task.assigned_node_id, "gpu-node");
        assert_eq!(task.status, TaskStatus::Queued);

        let preferred = mgr
            .dispatch_task(
                serde_json::json!({}),
                &["shell".into()],
                Some("cpu-node"),
                "generic",
            )
            .unwrap();
        assert_eq!(preferred.assigned_node_id, "cpu-node");

        // Preferred node lacking the capability falls through to a match.
        let fallback = mgr
            .dispatch_task(
                serde_json::json!({}),
                &["gpu".into()],
                Some("cpu-node"),
                "generic",
            )
            .unwrap();
        assert_eq!(fallback.assigned_node_id, "gpu-node");
    }

    #[test]
    fn dispatch_without_eligible_node_errors() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr.dispatch_task(serde_json::json!({}), &["gpu".into()], None, "generic");
        assert!(err.is_err());
    }

    #[test]
    fn claim_takes_oldest_queued_for_node() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.register_node("w", &["shell".into()], Map::new(), "").unwrap();
        let t1 = mgr
            .dispatch_task(serde_json::json!({"n": 1}), &["shell".into()], None, "generic")
            .unwrap();
        // Force distinct created_at ordering.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _t2 = mgr
            .dispatch_task(serde_json::json!({"n": 2}), &["shell".into()], None, "generic")
            .unwrap();

        let claimed = mgr.claim_task("w").unwrap();
        assert_eq!(claimed.task_id, t1.task_id);
        assert_eq!(claimed.status, TaskStatus::Running);

        assert!(mgr.claim_task("other-node").is_none());
    }

    #[test]
    fn complete_validates_assignment() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.register_node("w", &[], Map::new(), "").unwrap();
        let task = mgr
            .dispatch_task(serde_json::json!({}), &[], None, "generic")
            .unwrap();

        assert!(mgr
            .complete_task(&task.task_id, "intruder", None, None)
            .is_err());

        let done = mgr
            .complete_task(&task.task_id, "w", Some(serde_json::json!({"ok": true})), None)
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let failed = mgr
            .dispatch_task(serde_json::json!({}), &[], None, "generic")
            .unwrap();
        let failed = mgr
            .complete_task(&failed.task_id, "w", None, Some("boom".into()))
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn prune_never_drops_non_terminal_tasks() {
        let mut tasks = HashMap::new();
        for i in 0..150 {
            let status = if i < 120 {
                TaskStatus::Completed
            } else {
                TaskStatus::Queued
            };
            let task = DistributedTask {
                task_id: format!("task_{i}"),
                kind: "generic".into(),
                payload: Value::Null,
                required_capabilities: vec![],
                assigned_node_id: "w".into(),
                status,
                created_at_ms: i,
                updated_at_ms: i,
                claimed_at_ms: None,
                completed_at_ms: None,
                result: None,
                error: None,
            };
            tasks.insert(task.task_id.clone(), task);
        }

        DistributedManager::prune_tasks(&mut tasks, 100);
        assert_eq!(tasks.len(), 100);
        // All 30 queued tasks survive.
        let queued = tasks.values().filter(|t| t.status == TaskStatus::Queued).count();
        assert_eq!(queued, 30);
        // Remaining terminal tasks are the newest ones.
        assert!(tasks.contains_key("task_119"));
        assert!(!tasks.contains_key("task_0"));
    }

    #[test]
    fn state_persists_across_managers() {
        let dir = tempdir().unwrap();
        manager(dir.path())
            .register_node("w", &["shell".into()], Map::new(), "")
            .unwrap();
        let nodes = manager(dir.path()).list_nodes(true);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "w");
    }
}
