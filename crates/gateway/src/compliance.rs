//! Compliance operations: retention sweep, export bundle, targeted purge.
//!
//! Operates directly on the persisted stores (session JSONL files, the run
//! history ledger, the audit log, workspace memory notes, the usage ledger).
//! Export produces a tar.gz bundle; its output path must stay inside the
//! workspace or the data directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;

use courier_domain::config::RetentionConfig;
use courier_domain::error::{Error, Result};
use courier_sessions::scope::workspace_scope_id;

use crate::usage::UsageTracker;

#[derive(Debug, Default, Clone, Serialize)]
pub struct RemovedCounts {
    pub sessions: usize,
    pub runs: usize,
    pub audit: usize,
    pub memory: usize,
    pub usage: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub swept_at: DateTime<Utc>,
    pub retention_days: std::collections::BTreeMap<String, u32>,
    pub removed: RemovedCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub files: usize,
    pub size_bytes: u64,
    pub domains: Vec<String>,
}

pub struct ComplianceService {
    workspace: PathBuf,
    session_prefix: String,
    retention: RetentionConfig,
    sessions_dir: PathBuf,
    runs_path: PathBuf,
    audit_path: PathBuf,
    memory_dir: PathBuf,
    exports_dir: PathBuf,
    usage: Option<Arc<UsageTracker>>,
}

impl ComplianceService {
    pub fn new(
        workspace: &Path,
        data_dir: &Path,
        retention: RetentionConfig,
        usage: Option<Arc<UsageTracker>>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            session_prefix: format!("{}__", workspace_scope_id(workspace)),
            retention,
            sessions_dir: data_dir.join("sessions"),
            runs_path: data_dir.join("runs").join("runs.jsonl"),
            audit_path: data_dir.join("audit.log"),
            memory_dir: workspace.join("memory"),
            exports_dir: data_dir.join("exports"),
            usage,
        }
    }

    // ── Retention sweep ────────────────────────────────────────────

    /// Delete data older than the configured per-domain retention windows.
    pub fn sweep(&self) -> SweepSummary {
        let now = Utc::now();
        let mut retention_days = std::collections::BTreeMap::new();
        for domain in ["sessions", "runs", "audit", "memory"] {
            retention_days.insert(domain.to_owned(), self.retention.days_for(domain));
        }

        let session_cutoff = now - Duration::days(i64::from(self.retention.days_for("sessions")));
        let runs_cutoff = now - Duration::days(i64::from(self.retention.days_for("runs")));
        let audit_cutoff = now - Duration::days(i64::from(self.retention.days_for("audit")));
        let memory_cutoff =
            (now - Duration::days(i64::from(self.retention.days_for("memory")))).date_naive();

        let removed = RemovedCounts {
            sessions: self.delete_session_files_older_than(session_cutoff),
            runs: self.filter_jsonl(&self.runs_path.clone(), |obj| {
                parse_created_at(obj).map(|dt| dt >= runs_cutoff).unwrap_or(true)
            }),
            audit: self.filter_jsonl(&self.audit_path.clone(), |obj| {
                let ts = obj.get("ts").and_then(Value::as_f64).unwrap_or(0.0);
                ts <= 0.0 || ts >= audit_cutoff.timestamp() as f64
            }),
            memory: self.delete_memory_notes(|date| date >= memory_cutoff),
            usage: 0,
        };

        SweepSummary {
            swept_at: now,
            retention_days,
            removed,
        }
    }

    fn delete_session_files_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for path in self.session_files() {
            let modified = path
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from);
            if let Ok(modified) = modified {
                if modified < cutoff && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn session_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&self.session_prefix) && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Rewrite a JSONL file keeping lines matching `keep`. Malformed lines
    /// are kept. Returns the number of removed records.
    fn filter_jsonl(&self, path: &Path, keep: impl Fn(&Value) -> bool) -> usize {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return 0,
        };
        let mut kept = Vec::new();
        let mut removed = 0;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(obj) if !keep(&obj) => removed += 1,
                _ => kept.push(line.to_owned()),
            }
        }
        let payload = if kept.is_empty() {
            String::new()
        } else {
            format!("{}\n", kept.join("\n"))
        };
        if fs::write(path, payload).is_err() {
            return 0;
        }
        removed
    }

    fn delete_memory_notes(&self, keep: impl Fn(NaiveDate) -> bool) -> usize {
        let entries = match fs::read_dir(&self.memory_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let date = match NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                Ok(date) => date,
                Err(_) => continue,
            };
            if !keep(date) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    // ── Export ─────────────────────────────────────────────────────

    /// Export selected data domains to a tar.gz bundle.
    pub fn export_bundle(
        &self,
        include: Option<&[String]>,
        output_path: Option<&str>,
    ) -> Result<ExportSummary> {
        let default_domains = ["sessions", "runs", "audit", "memory", "usage"];
        let domains: Vec<String> = match include {
            Some(list) => list.to_vec(),
            None => default_domains.iter().map(|s| (*s).to_owned()).collect(),
        };

        fs::create_dir_all(&self.exports_dir)?;
        let output = match output_path {
            Some(raw) => self.resolve_output_path(raw)?,
            None => self.exports_dir.join(format!(
                "courier-export-{}.tar.gz",
                Utc::now().format("%Y%m%d-%H%M%S")
            )),
        };
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(&output)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut files = 0usize;

        let meta = serde_json::json!({
            "created_at": Utc::now().to_rfc3339(),
            "domains": domains,
        });
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(meta_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "metadata.json", meta_bytes.as_slice())?;
        files += 1;

        if domains.iter().any(|d| d == "sessions") {
            for path in self.session_files() {
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                builder.append_path_with_name(&path, format!("sessions/{name}"))?;
                files += 1;
            }
        }
        if domains.iter().any(|d| d == "runs") && self.runs_path.exists() {
            builder.append_path_with_name(&self.runs_path, "runs/runs.jsonl")?;
            files += 1;
        }
        if domains.iter().any(|d| d == "audit") && self.audit_path.exists() {
            builder.append_path_with_name(&self.audit_path, "audit/audit.log")?;
            files += 1;
        }
        if domains.iter().any(|d| d == "memory") && self.memory_dir.exists() {
            files += append_tree(&mut builder, &self.memory_dir, "memory")?;
        }
        if domains.iter().any(|d| d == "usage") {
            if let Some(usage) = &self.usage {
                if usage.store_path().exists() {
                    builder.append_path_with_name(usage.store_path(), "usage/usage.jsonl")?;
                    files += 1;
                }
            }
        }

        builder.into_inner()?.finish()?;
        let size_bytes = output.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(ExportSummary {
            path: output,
            files,
            size_bytes,
            domains,
        })
    }

    fn resolve_output_path(&self, raw: &str) -> Result<PathBuf> {
        let candidate = Path::new(raw);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        };
        let inside_workspace = resolved.starts_with(&self.workspace);
        let inside_exports = resolved.starts_with(&self.exports_dir);
        if !inside_workspace && !inside_exports {
            return Err(Error::Other(
                "output_path must stay inside the workspace.".into(),
            ));
        }
        Ok(resolved)
    }

    // ── Purge ──────────────────────────────────────────────────────

    /// Purge data matching session/user/date filters. At least one filter is
    /// required.
    pub fn purge(
        &self,
        session_key: Option<&str>,
        user_id: Option<&str>,
        before_date: Option<&str>,
        domains: Option<&[String]>,
    ) -> Result<RemovedCounts> {
        if session_key.is_none() && user_id.is_none() && before_date.is_none() {
            return Err(Error::Other(
                "at least one filter is required (session_key, user_id, before_date)".into(),
            ));
        }
        let cutoff = before_date.map(parse_before_date).transpose()?;
        let default_domains = ["sessions", "runs", "audit", "memory", "usage"];
        let selected: Vec<String> = match domains {
            Some(list) => list.to_vec(),
            None => default_domains.iter().map(|s| (*s).to_owned()).collect(),
        };
        let wants = |d: &str| selected.iter().any(|s| s == d);

        let mut removed = RemovedCounts::default();

        if wants("sessions") {
            removed.sessions = self.purge_sessions(session_key, user_id, cutoff);
        }
        if wants("runs") {
            removed.runs = self.filter_jsonl(&self.runs_path.clone(), |obj| {
                let run_session = obj
                    .get("session_key")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let ts = parse_created_at(obj);
                !matches_filters(run_session, "", ts, session_key, user_id, cutoff)
            });
        }
        if wants("audit") {
            removed.audit = self.filter_jsonl(&self.audit_path.clone(), |obj| {
                let data = obj.get("data").cloned().unwrap_or(Value::Null);
                let event_session = data
                    .get("session_key")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let sender = data
                    .get("sender_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let ts = obj
                    .get("ts")
                    .and_then(Value::as_f64)
                    .and_then(|ts| DateTime::from_timestamp(ts as i64, 0));
                !matches_filters(&event_session, &sender, ts, session_key, user_id, cutoff)
            });
        }
        if wants("memory") {
            if let Some(cutoff) = cutoff {
                let cutoff_date = cutoff.date_naive();
                removed.memory = self.delete_memory_notes(|date| date >= cutoff_date);
            }
        }
        if wants("usage") {
            if let Some(usage) = &self.usage {
                removed.usage = usage.purge(
                    session_key,
                    user_id,
                    cutoff.map(|dt| dt.timestamp_millis()),
                );
            }
        }
        Ok(removed)
    }

    fn purge_sessions(
        &self,
        session_key: Option<&str>,
        user_id: Option<&str>,
        cutoff: Option<DateTime<Utc>>,
    ) -> usize {
        let mut removed = 0;
        for path in self.session_files() {
            let key = session_key_for_file(&path);
            let modified = path
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .ok();
            if matches_filters(&key, "", modified, session_key, user_id, cutoff)
                && fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        removed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_created_at(obj: &Value) -> Option<DateTime<Utc>> {
    obj.get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// `before_date` is inclusive of the named day: the cutoff is midnight of
/// the following day.
fn parse_before_date(raw: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| Error::Other("before_date must be YYYY-MM-DD".into()))?;
    let next = date + Duration::days(1);
    Ok(DateTime::from_naive_utc_and_offset(
        next.and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    ))
}

fn matches_filters(
    session: &str,
    user: &str,
    ts: Option<DateTime<Utc>>,
    session_key: Option<&str>,
    user_id: Option<&str>,
    cutoff: Option<DateTime<Utc>>,
) -> bool {
    if let Some(filter) = session_key {
        if session != filter {
            return false;
        }
    }
    if let Some(filter) = user_id {
        if user != filter && !session.contains(filter) {
            return false;
        }
    }
    if let Some(cutoff) = cutoff {
        match ts {
            Some(ts) if ts < cutoff => {}
            _ => return false,
        }
    }
    session_key.is_some() || user_id.is_some() || cutoff.is_some()
}

/// Prefer the metadata record's session key; fall back to decoding the
/// file stem.
fn session_key_for_file(path: &Path) -> String {
    let fallback = {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let raw = stem.split_once("__").map(|(_, rest)| rest).unwrap_or(stem);
        match raw.split_once('_') {
            Some((channel, chat_id)) => format!("{channel}:{chat_id}"),
            None => raw.to_owned(),
        }
    };
    let first_line = fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.lines().next().map(str::to_owned));
    first_line
        .and_then(|line| serde_json::from_str::<Value>(&line).ok())
        .and_then(|obj| {
            obj.get("session_key")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .filter(|key| !key.is_empty())
        .unwrap_or(fallback)
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &str,
) -> Result<usize> {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)?.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path.strip_prefix(dir).unwrap_or(&path);
            builder.append_path_with_name(&path, format!("{prefix}/{}", rel.display()))?;
            count += 1;
        }
    }
    Ok(count)
}
