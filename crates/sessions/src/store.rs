//! Session manager — JSONL files with atomic writes and backup recovery.
//!
//! File layout: `<sessions_dir>/<workspace_scope>__<safe_key>.jsonl`. The
//! first line is a metadata record, every following line one message. Writes
//! go through a temp file with fsync, the previous file becomes `.bak`, and
//! a corrupted primary recovers from that backup on read.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use courier_domain::error::{Error, Result};

use crate::scope::{safe_filename, workspace_scope_id};
use crate::session::{Session, SessionMessage};

#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    #[serde(rename = "_type")]
    record_type: String,
    session_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Map<String, Value>,
}

/// Summary row returned by [`SessionManager::list_sessions`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
    pub messages: usize,
}

pub struct SessionManager {
    workspace: PathBuf,
    workspace_scope: String,
    sessions_dir: PathBuf,
    idle_reset_minutes: u64,
    cache: Mutex<HashMap<String, Session>>,
    save_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(workspace: &Path, sessions_dir: &Path, idle_reset_minutes: u64) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            workspace_scope: workspace_scope_id(workspace),
            sessions_dir: sessions_dir.to_path_buf(),
            idle_reset_minutes,
            cache: Mutex::new(HashMap::new()),
            save_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn workspace_scope(&self) -> &str {
        &self.workspace_scope
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn scoped_stem(&self, key: &str) -> String {
        let safe_key = safe_filename(&key.replace(':', "_"));
        format!("{}__{}", self.workspace_scope, safe_key)
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", self.scoped_stem(key)))
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        path.with_file_name(name)
    }

    fn save_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.save_locks
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get a cached session or load/create one. Returns a snapshot; callers
    /// mutate the copy and [`save`](Self::save) it back.
    pub fn get_or_create(&self, key: &str) -> Session {
        if let Some(session) = self.cache.lock().get(key) {
            return session.clone();
        }
        let session = self.load(key).unwrap_or_else(|| Session::new(key));
        self.cache
            .lock()
            .insert(key.to_owned(), session.clone());
        session
    }

    fn load(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }
        match Self::load_from_path(&path, key) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to load session; trying backup");
                self.recover_from_backup(&path, key)
            }
        }
    }

    fn load_from_path(path: &Path, key: &str) -> Result<Session> {
        let raw = fs::read_to_string(path)?;
        let mut messages = Vec::new();
        let mut metadata = Map::new();
        let mut created_at = None;
        let mut updated_at = None;

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)?;
            if value.get("_type").and_then(Value::as_str) == Some("metadata") {
                let record: MetadataRecord = serde_json::from_value(value)?;
                metadata = record.metadata;
                created_at = Some(record.created_at);
                updated_at = Some(record.updated_at);
            } else {
                let msg: SessionMessage = serde_json::from_value(value)?;
                messages.push(msg);
            }
        }

        let summary = metadata
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let created = created_at.unwrap_or_else(Utc::now);
        Ok(Session {
            key: key.to_owned(),
            messages,
            summary,
            metadata,
            created_at: created,
            updated_at: updated_at.unwrap_or(created),
        })
    }

    fn recover_from_backup(&self, path: &Path, key: &str) -> Option<Session> {
        let backup = Self::backup_path(path);
        if !backup.exists() {
            return None;
        }
        match Self::load_from_path(&backup, key) {
            Ok(session) => {
                tracing::warn!(key, backup = %backup.display(), "recovered session from backup");
                // Promote the backup to primary.
                if let Err(e) = fs::rename(&backup, path) {
                    tracing::debug!(error = %e, "backup promotion failed");
                }
                Some(session)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "session backup is also unreadable");
                None
            }
        }
    }

    /// Persist a session atomically and refresh the cache.
    pub fn save(&self, session: &Session) -> Result<()> {
        let mut to_store = session.clone();
        to_store
            .metadata
            .insert("summary".into(), Value::String(to_store.summary.clone()));

        let record = MetadataRecord {
            record_type: "metadata".into(),
            session_key: to_store.key.clone(),
            created_at: to_store.created_at,
            updated_at: to_store.updated_at,
            metadata: to_store.metadata.clone(),
        };
        let mut payload = serde_json::to_string(&record)?;
        payload.push('\n');
        for msg in &to_store.messages {
            payload.push_str(&serde_json::to_string(msg)?);
            payload.push('\n');
        }

        let path = self.session_path(&to_store.key);
        let lock = self.save_lock(&to_store.key);
        {
            let _guard = lock.lock();
            Self::write_atomic(&path, &payload)?;
        }

        self.cache.lock().insert(to_store.key.clone(), to_store);
        Ok(())
    }

    /// Temp file + fsync, then rotate primary → `.bak` and tmp → primary.
    /// On failure the backup is restored.
    fn write_atomic(path: &Path, payload: &str) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Store("session path has no parent".into()))?;
        fs::create_dir_all(parent)?;

        let backup = Self::backup_path(path);
        let tmp = path.with_extension("jsonl.tmp");
        let had_existing = path.exists();

        let result: Result<()> = (|| {
            {
                let mut file = fs::File::create(&tmp)?;
                file.write_all(payload.as_bytes())?;
                file.sync_all()?;
            }
            if had_existing {
                fs::rename(path, &backup)?;
            }
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            if had_existing && backup.exists() && !path.exists() {
                let _ = fs::rename(&backup, path);
            }
        }
        result
    }

    /// Reset a session that has been idle beyond policy. Returns true when a
    /// reset happened (and was persisted).
    pub fn apply_idle_reset(&self, session: &mut Session) -> bool {
        if self.idle_reset_minutes == 0 {
            return false;
        }
        if session.messages.is_empty() && session.summary.is_empty() {
            return false;
        }
        let idle_minutes = (Utc::now() - session.updated_at).num_seconds() as f64 / 60.0;
        if idle_minutes < self.idle_reset_minutes as f64 {
            return false;
        }

        session.clear();
        session.summary.clear();
        session.metadata = Map::new();
        session.metadata.insert(
            "idle_reset_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        session.metadata.insert(
            "idle_reset_minutes".into(),
            Value::Number(self.idle_reset_minutes.into()),
        );
        if let Err(e) = self.save(session) {
            tracing::warn!(key = %session.key, error = %e, "idle reset save failed");
        }
        true
    }

    /// Reset every known session (persisted and cached), stamping the reset
    /// reason and actor. Returns how many sessions had content.
    pub fn reset_all(&self, reason: &str, actor: &str, include_persisted: bool) -> usize {
        let mut keys: Vec<String> = Vec::new();
        if include_persisted {
            for info in self.list_sessions() {
                keys.push(info.key);
            }
        }
        for (key, session) in self.cache.lock().iter() {
            if !session.messages.is_empty()
                || !session.summary.is_empty()
                || !session.metadata.is_empty()
            {
                keys.push(key.clone());
            }
        }
        keys.sort();
        keys.dedup();

        let reset_at = Utc::now().to_rfc3339();
        let mut reset_count = 0;
        for key in keys {
            let mut session = self.get_or_create(&key);
            let had_content = !session.messages.is_empty()
                || !session.summary.is_empty()
                || !session.metadata.is_empty();
            session.clear();
            session.summary.clear();
            session.metadata = Map::new();
            session
                .metadata
                .insert("bulk_reset_at".into(), Value::String(reset_at.clone()));
            session
                .metadata
                .insert("bulk_reset_reason".into(), Value::String(reason.into()));
            session
                .metadata
                .insert("bulk_reset_actor".into(), Value::String(actor.into()));
            if let Err(e) = self.save(&session) {
                tracing::warn!(key = %session.key, error = %e, "bulk reset save failed");
                continue;
            }
            if had_content {
                reset_count += 1;
            }
        }
        reset_count
    }

    /// Delete a session from cache and disk. Returns true when a file was
    /// removed.
    pub fn delete(&self, key: &str) -> bool {
        self.cache.lock().remove(key);
        let path = self.session_path(key);
        let mut removed = false;
        if path.exists() && fs::remove_file(&path).is_ok() {
            removed = true;
        }
        let backup = Self::backup_path(&path);
        if backup.exists() {
            let _ = fs::remove_file(&backup);
        }
        removed
    }

    /// List persisted sessions for this workspace, newest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let prefix = format!("{}__", self.workspace_scope);
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(_) => return out,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
                continue;
            }
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
            let first = match lines.next() {
                Some(first) => first,
                None => continue,
            };
            let record: MetadataRecord = match serde_json::from_str(first) {
                Ok(record) => record,
                Err(_) => continue,
            };
            out.push(SessionInfo {
                key: record.session_key,
                created_at: Some(record.created_at),
                updated_at: Some(record.updated_at),
                path: path.clone(),
                messages: lines.count(),
            });
        }

        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> SessionManager {
        SessionManager::new(&dir.join("ws"), &dir.join("sessions"), 0)
    }

    #[test]
    fn save_load_roundtrip_is_byte_identical() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let mut session = mgr.get_or_create("telegram:42");
        session.add_message("user", "hello");
        session.add_message("assistant", "hi there");
        session.summary = "greeting".into();
        mgr.save(&session).unwrap();

        let path = mgr.session_path("telegram:42");
        let first_bytes = fs::read(&path).unwrap();

        // Load into a fresh manager and save again.
        let mgr2 = manager(dir.path());
        let loaded = mgr2.get_or_create("telegram:42");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.summary, "greeting");
        mgr2.save(&loaded).unwrap();
        let second_bytes = fs::read(&path).unwrap();
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn file_starts_with_single_metadata_record() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut session = mgr.get_or_create("cli:direct");
        session.add_message("user", "one");
        mgr.save(&session).unwrap();

        let raw = fs::read_to_string(mgr.session_path("cli:direct")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["_type"], "metadata");
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second.get("_type").is_none());
        assert_eq!(second["role"], "user");
    }

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut session = mgr.get_or_create("cli:direct");
        session.add_message("user", "first save");
        mgr.save(&session).unwrap();
        session.add_message("user", "second save");
        mgr.save(&session).unwrap(); // previous file is now the .bak

        let path = mgr.session_path("cli:direct");
        fs::write(&path, "{not json").unwrap();

        let mgr2 = manager(dir.path());
        let recovered = mgr2.get_or_create("cli:direct");
        assert_eq!(recovered.messages.len(), 1);
        assert_eq!(recovered.messages[0].content, "first save");
        // Backup was promoted back to primary.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("first save"));
    }

    #[test]
    fn idle_reset_clears_and_stamps() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(&dir.path().join("ws"), &dir.path().join("sessions"), 30);

        let mut session = Session::new("telegram:42");
        session.add_message("user", "old message");
        session.updated_at = Utc::now() - chrono::Duration::minutes(45);
        assert!(mgr.apply_idle_reset(&mut session));
        assert!(session.messages.is_empty());
        assert!(session.metadata.get("idle_reset_at").is_some());

        // A fresh session is never reset.
        let mut fresh = Session::new("telegram:43");
        fresh.add_message("user", "new");
        assert!(!mgr.apply_idle_reset(&mut fresh));
    }

    #[test]
    fn idle_reset_disabled_when_zero() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut session = Session::new("telegram:42");
        session.add_message("user", "x");
        session.updated_at = Utc::now() - chrono::Duration::days(30);
        assert!(!mgr.apply_idle_reset(&mut session));
    }

    #[test]
    fn bulk_reset_stamps_reason_and_actor() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        for key in ["a:1", "b:2"] {
            let mut session = mgr.get_or_create(key);
            session.add_message("user", "content");
            mgr.save(&session).unwrap();
        }

        let count = mgr.reset_all("scheduled", "system", true);
        assert_eq!(count, 2);

        let session = mgr.get_or_create("a:1");
        assert!(session.messages.is_empty());
        assert_eq!(
            session.metadata.get("bulk_reset_reason").and_then(Value::as_str),
            Some("scheduled")
        );
        assert_eq!(
            session.metadata.get("bulk_reset_actor").and_then(Value::as_str),
            Some("system")
        );
    }

    #[test]
    fn list_sessions_scoped_to_workspace() {
        let dir = tempdir().unwrap();
        let mgr_a = SessionManager::new(&dir.path().join("ws-a"), &dir.path().join("sessions"), 0);
        let mgr_b = SessionManager::new(&dir.path().join("ws-b"), &dir.path().join("sessions"), 0);

        let mut session = mgr_a.get_or_create("telegram:42");
        session.add_message("user", "x");
        mgr_a.save(&session).unwrap();

        assert_eq!(mgr_a.list_sessions().len(), 1);
        assert_eq!(mgr_a.list_sessions()[0].key, "telegram:42");
        assert_eq!(mgr_a.list_sessions()[0].messages, 1);
        assert!(mgr_b.list_sessions().is_empty());
    }

    #[test]
    fn delete_removes_file_and_cache() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut session = mgr.get_or_create("cli:direct");
        session.add_message("user", "x");
        mgr.save(&session).unwrap();

        assert!(mgr.delete("cli:direct"));
        assert!(!mgr.session_path("cli:direct").exists());
        assert!(mgr.get_or_create("cli:direct").messages.is_empty());
        assert!(!mgr.delete("cli:direct"));
    }
}
