//! Structured JSON-lines audit log.
//!
//! Tool executions, message traffic, and lifecycle events are appended as
//! one JSON object per line, sanitized before write. The `level` controls
//! how much detail lands in the file.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::{json, Value};

use courier_domain::config::AuditLevel;
use courier_domain::event::now_ts;
use courier_domain::sanitize::{sanitize_str, sanitize_value};

pub struct AuditLogger {
    log_path: PathBuf,
    level: AuditLevel,
    guard: Mutex<()>,
}

impl AuditLogger {
    pub fn new(log_path: PathBuf, level: AuditLevel) -> Self {
        if let Some(parent) = log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self {
            log_path,
            level,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.log_path
    }

    fn write(&self, mut entry: Value) {
        entry["ts"] = json!(now_ts());
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "audit serialization failed");
                return;
            }
        };
        let _guard = self.guard.lock();
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(error = %e, "audit write failed");
        }
    }

    pub fn log_tool(
        &self,
        tool_name: &str,
        params: &Value,
        result: &str,
        duration_ms: f64,
        success: bool,
    ) {
        let mut entry = json!({
            "type": "tool",
            "tool": tool_name,
            "ok": success,
            "ms": (duration_ms * 10.0).round() / 10.0,
        });
        if matches!(self.level, AuditLevel::Standard | AuditLevel::Verbose) {
            entry["params"] = sanitize_value(params, 300);
        }
        if self.level == AuditLevel::Verbose && !result.is_empty() {
            entry["result"] = Value::String(sanitize_str(result, 800));
        }
        self.write(entry);
    }

    pub fn log_message(&self, direction: &str, channel: &str, length: usize, sender: &str) {
        let mut entry = json!({
            "type": "message",
            "dir": direction,
            "channel": channel,
            "len": length,
        });
        if matches!(self.level, AuditLevel::Standard | AuditLevel::Verbose) && !sender.is_empty() {
            entry["sender"] = Value::String(sender.to_owned());
        }
        self.write(entry);
    }

    pub fn log_event(&self, event: &str, data: Value) {
        let mut entry = json!({"type": "event", "event": event});
        if !data.is_null() {
            entry["data"] = sanitize_value(&data, 500);
        }
        self.write(entry);
    }
}

impl courier_tools::ToolAudit for AuditLogger {
    fn log_tool(&self, tool_name: &str, params: &Value, result: &str, duration_ms: f64, ok: bool) {
        AuditLogger::log_tool(self, tool_name, params, result, duration_ms, ok);
    }
}
