//! Lifecycle hook runner.
//!
//! Hooks are workspace-configured shell commands triggered at lifecycle
//! points. Configuration lives in `<workspace>/hooks/hooks.json`; each event
//! maps to one or more entries with a command, optional tool matchers, and
//! an optional per-entry timeout. A non-zero `PreToolUse` exit blocks the
//! tool call. Safe mode filters hook commands through an allow-prefix /
//! deny-substring policy before they run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use courier_domain::config::HooksConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    SessionStart,
    SessionEnd,
    PreToolUse,
    PostToolUse,
    PreCompact,
    Stop,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PreCompact => "PreCompact",
            Self::Stop => "Stop",
        }
    }
}

/// Result summary for one hook event run.
#[derive(Debug, Default)]
pub struct HookRunResult {
    pub executed: usize,
    pub blocked: bool,
    pub errors: Vec<String>,
}

impl HookRunResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct HookRunner {
    workspace: PathBuf,
    enabled: bool,
    config_path: PathBuf,
    timeout: Duration,
    safe_mode: bool,
    allow_command_prefixes: Vec<String>,
    deny_command_patterns: Vec<String>,
}

impl HookRunner {
    pub fn new(workspace: &Path, config: &HooksConfig) -> Self {
        let hooks_dir = {
            let p = Path::new(&config.path);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                workspace.join(p)
            }
        };
        Self {
            workspace: workspace.to_path_buf(),
            enabled: config.enabled,
            config_path: hooks_dir.join(&config.config_file),
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
            safe_mode: config.safe_mode,
            allow_command_prefixes: config
                .allow_command_prefixes
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
            deny_command_patterns: config
                .deny_command_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    fn load_entries(&self, event: HookEvent) -> Vec<Value> {
        if !self.enabled || !self.config_path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %self.config_path.display(), error = %e, "failed reading hook config");
                return Vec::new();
            }
        };
        let data: Value = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(path = %self.config_path.display(), error = %e, "failed parsing hook config");
                return Vec::new();
            }
        };
        // Accept either {"hooks": {...}} or the event map directly.
        let map = data
            .get("hooks")
            .and_then(Value::as_object)
            .or_else(|| data.as_object());
        let raw_entries = match map.and_then(|m| m.get(event.as_str())) {
            Some(raw) => raw,
            None => return Vec::new(),
        };

        match raw_entries {
            Value::String(cmd) => vec![serde_json::json!({ "command": cmd })],
            Value::Object(_) => vec![raw_entries.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(cmd) => Some(serde_json::json!({ "command": cmd })),
                    Value::Object(_) => Some(item.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn entry_matches_tool(entry: &Value, tool_name: Option<&str>) -> bool {
        let tool_name = match tool_name {
            Some(name) => name,
            None => return true,
        };
        let patterns = entry
            .get("matchers")
            .or_else(|| entry.get("tools"))
            .cloned();
        let patterns = match patterns {
            Some(Value::String(p)) => vec![p],
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => return true,
        };
        if patterns.is_empty() {
            return true;
        }
        patterns.iter().any(|p| glob_match(p, tool_name))
    }

    fn command_allowed(&self, command: &str) -> Result<(), String> {
        if !self.safe_mode {
            return Ok(());
        }
        let lower = command.to_lowercase();
        for pattern in &self.deny_command_patterns {
            if lower.contains(pattern) {
                return Err(format!("Hook command blocked by deny pattern: {pattern}"));
            }
        }
        if !self.allow_command_prefixes.is_empty()
            && !self
                .allow_command_prefixes
                .iter()
                .any(|prefix| command.starts_with(prefix))
        {
            let joined = self.allow_command_prefixes.join(", ");
            return Err(format!("Hook command not in allow prefixes ({joined})"));
        }
        Ok(())
    }

    /// Run all hooks for an event. `PreToolUse` failures set `blocked`.
    pub async fn run(&self, event: HookEvent, payload: &Value) -> HookRunResult {
        let mut result = HookRunResult::default();
        if !self.enabled {
            return result;
        }

        let entries = self.load_entries(event);
        if entries.is_empty() {
            return result;
        }

        let tool_name = payload
            .get("tool_name")
            .or_else(|| payload.get("tool"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for entry in entries {
            if entry.get("enabled").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            if !Self::entry_matches_tool(&entry, tool_name) {
                continue;
            }
            let command = entry
                .get("command")
                .or_else(|| entry.get("cmd"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if command.is_empty() {
                continue;
            }

            if let Err(reason) = self.command_allowed(command) {
                result.errors.push(reason);
                if event == HookEvent::PreToolUse {
                    result.blocked = true;
                    break;
                }
                continue;
            }

            let timeout = entry
                .get("timeout_seconds")
                .and_then(Value::as_u64)
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(self.timeout);
            let (ok, error) = self.run_command(command, event, payload, timeout).await;
            result.executed += 1;
            if let Some(error) = error {
                result.errors.push(error);
            }
            if event == HookEvent::PreToolUse && !ok {
                result.blocked = true;
                break;
            }
        }
        result
    }

    async fn run_command(
        &self,
        command: &str,
        event: HookEvent,
        payload: &Value,
        timeout: Duration,
    ) -> (bool, Option<String>) {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .env("COURIER_HOOK_EVENT", event.as_str())
            .env("COURIER_HOOK_PAYLOAD", payload.to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("{} hook failed to execute: {e}", event.as_str());
                tracing::warn!("{msg}");
                return (false, Some(msg));
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let msg = format!("{} hook failed to execute: {e}", event.as_str());
                tracing::warn!("{msg}");
                return (false, Some(msg));
            }
            Err(_) => {
                let msg = format!(
                    "{} hook timed out after {}s: {command}",
                    event.as_str(),
                    timeout.as_secs()
                );
                tracing::warn!("{msg}");
                return (false, Some(msg));
            }
        };

        if output.status.success() {
            return (true, None);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut snippet = if !stderr.trim().is_empty() {
            stderr.trim().to_owned()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_owned()
        } else {
            format!("exit {}", output.status.code().unwrap_or(-1))
        };
        if snippet.len() > 800 {
            snippet.truncate(800);
            snippet.push_str("... (truncated)");
        }
        let msg = format!(
            "{} hook returned non-zero ({}): {snippet}",
            event.as_str(),
            output.status.code().unwrap_or(-1)
        );
        tracing::warn!("{msg}");
        (false, Some(msg))
    }
}

/// Minimal glob match supporting `*` wildcards (tool matchers).
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[char], v: &[char]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    inner(&p, &v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_hooks(dir: &Path, hooks: Value) {
        let hooks_dir = dir.join("hooks");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        std::fs::write(
            hooks_dir.join("hooks.json"),
            serde_json::to_string(&json!({ "hooks": hooks })).unwrap(),
        )
        .unwrap();
    }

    fn runner(dir: &Path, safe_mode: bool) -> HookRunner {
        let config = HooksConfig {
            enabled: true,
            safe_mode,
            timeout_seconds: 5,
            ..Default::default()
        };
        HookRunner::new(dir, &config)
    }

    #[tokio::test]
    async fn disabled_runner_is_a_noop() {
        let dir = tempdir().unwrap();
        write_hooks(dir.path(), json!({"SessionStart": "exit 1"}));
        let config = HooksConfig::default(); // disabled
        let runner = HookRunner::new(dir.path(), &config);
        let result = runner.run(HookEvent::SessionStart, &json!({})).await;
        assert_eq!(result.executed, 0);
        assert!(result.ok());
    }

    #[tokio::test]
    async fn successful_hook_executes() {
        let dir = tempdir().unwrap();
        write_hooks(dir.path(), json!({"SessionStart": "true"}));
        let runner = runner(dir.path(), false);
        let result = runner.run(HookEvent::SessionStart, &json!({})).await;
        assert_eq!(result.executed, 1);
        assert!(result.ok());
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn pre_tool_use_nonzero_exit_blocks() {
        let dir = tempdir().unwrap();
        write_hooks(dir.path(), json!({"PreToolUse": "exit 2"}));
        let runner = runner(dir.path(), false);
        let result = runner
            .run(HookEvent::PreToolUse, &json!({"tool_name": "exec"}))
            .await;
        assert!(result.blocked);
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn post_tool_use_failure_does_not_block() {
        let dir = tempdir().unwrap();
        write_hooks(dir.path(), json!({"PostToolUse": "exit 2"}));
        let runner = runner(dir.path(), false);
        let result = runner
            .run(HookEvent::PostToolUse, &json!({"tool_name": "exec"}))
            .await;
        assert!(!result.blocked);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn tool_matchers_filter_entries() {
        let dir = tempdir().unwrap();
        write_hooks(
            dir.path(),
            json!({"PreToolUse": [{"command": "exit 1", "matchers": ["exec", "apply_*"]}]}),
        );
        let runner = runner(dir.path(), false);

        let blocked = runner
            .run(HookEvent::PreToolUse, &json!({"tool_name": "apply_patch"}))
            .await;
        assert!(blocked.blocked);

        let passed = runner
            .run(HookEvent::PreToolUse, &json!({"tool_name": "read_file"}))
            .await;
        assert!(!passed.blocked);
        assert_eq!(passed.executed, 0);
    }

    #[tokio::test]
    async fn payload_is_passed_through_env() {
        let dir = tempdir().unwrap();
        write_hooks(
            dir.path(),
            json!({"SessionStart": "test \"$COURIER_HOOK_EVENT\" = SessionStart && echo \"$COURIER_HOOK_PAYLOAD\" | grep -q r123"}),
        );
        let runner = runner(dir.path(), false);
        let result = runner
            .run(HookEvent::SessionStart, &json!({"run_id": "r123"}))
            .await;
        assert!(result.ok(), "errors: {:?}", result.errors);
    }

    #[tokio::test]
    async fn safe_mode_deny_pattern_blocks_pre_tool_use() {
        let dir = tempdir().unwrap();
        write_hooks(dir.path(), json!({"PreToolUse": "shutdown -h now"}));
        let runner = runner(dir.path(), true);
        let result = runner
            .run(HookEvent::PreToolUse, &json!({"tool_name": "exec"}))
            .await;
        assert!(result.blocked);
        assert!(result.errors[0].contains("deny pattern"));
        assert_eq!(result.executed, 0);
    }

    #[tokio::test]
    async fn safe_mode_allow_prefixes_restrict_commands() {
        let dir = tempdir().unwrap();
        write_hooks(dir.path(), json!({"SessionEnd": "echo bye"}));
        let config = HooksConfig {
            enabled: true,
            safe_mode: true,
            allow_command_prefixes: vec!["notify-send".into()],
            ..Default::default()
        };
        let runner = HookRunner::new(dir.path(), &config);
        let result = runner.run(HookEvent::SessionEnd, &json!({})).await;
        assert_eq!(result.executed, 0);
        assert!(result.errors[0].contains("allow prefixes"));
    }

    #[tokio::test]
    async fn hook_timeout_is_an_error() {
        let dir = tempdir().unwrap();
        write_hooks(
            dir.path(),
            json!({"SessionStart": [{"command": "sleep 5", "timeout_seconds": 1}]}),
        );
        let runner = runner(dir.path(), false);
        let result = runner.run(HookEvent::SessionStart, &json!({})).await;
        assert!(result.errors[0].contains("timed out"));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("exec", "exec"));
        assert!(glob_match("apply_*", "apply_patch"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("exec", "process"));
    }
}
