//! Shell execution tool.
//!
//! Host mode runs the command through `sh -c` with a timeout and a
//! command-safety guard. Sandbox mode delegates to the Docker sandbox and
//! fails closed when docker is unavailable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

use courier_domain::config::{ExecToolConfig, SandboxConfig, SandboxMode};
use courier_domain::sanitize::truncate_with_marker;

use crate::sandbox::{CommandRunner, DockerSandbox, ProcessRunner, SandboxContext};
use crate::{Tool, ToolContext};

const MAX_RESULT_LEN: usize = 10_000;

/// Default deny patterns: destructive filesystem/disk operations, system
/// power commands, fork bombs.
pub fn default_deny_patterns() -> Vec<Regex> {
    [
        r"\brm\s+-[rf]{1,2}\b",
        r"\bdel\s+/[fq]\b",
        r"\brmdir\s+/s\b",
        r"\b(format|mkfs|diskpart)\b",
        r"\bdd\s+if=",
        r">\s*/dev/sd",
        r"\b(shutdown|reboot|poweroff)\b",
        r":\(\)\s*\{.*\};\s*:",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
}

pub struct ExecTool {
    timeout: Duration,
    working_dir: PathBuf,
    deny_patterns: Vec<Regex>,
    allow_patterns: Vec<Regex>,
    restrict_to_workspace: bool,
    sandbox_mode: SandboxMode,
    agent_id: String,
    sandbox: Option<Arc<DockerSandbox>>,
    runner: Arc<dyn CommandRunner>,
    /// Probe for docker on PATH; injectable for fail-closed tests.
    docker_probe: Box<dyn Fn() -> bool + Send + Sync>,
    session_key: Mutex<String>,
}

impl ExecTool {
    pub fn new(
        working_dir: PathBuf,
        exec_config: &ExecToolConfig,
        sandbox_config: &SandboxConfig,
        agent_id: impl Into<String>,
        restrict_to_workspace: bool,
    ) -> Self {
        Self::with_runner(
            working_dir,
            exec_config,
            sandbox_config,
            agent_id,
            restrict_to_workspace,
            Arc::new(ProcessRunner),
        )
    }

    pub fn with_runner(
        working_dir: PathBuf,
        exec_config: &ExecToolConfig,
        sandbox_config: &SandboxConfig,
        agent_id: impl Into<String>,
        restrict_to_workspace: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let sandbox = if sandbox_config.mode != SandboxMode::Off {
            Some(Arc::new(DockerSandbox::new(
                sandbox_config,
                working_dir.clone(),
                exec_config.resource_limits,
                runner.clone(),
            )))
        } else {
            None
        };
        let agent_id = {
            let id = agent_id.into().trim().to_owned();
            if id.is_empty() {
                "default".to_owned()
            } else {
                id
            }
        };
        Self {
            timeout: Duration::from_secs(exec_config.timeout.max(1)),
            working_dir,
            deny_patterns: default_deny_patterns(),
            allow_patterns: Vec::new(),
            restrict_to_workspace,
            sandbox_mode: sandbox_config.mode,
            agent_id,
            sandbox,
            runner,
            docker_probe: Box::new(docker_on_path),
            session_key: Mutex::new(String::new()),
        }
    }

    pub fn with_allow_patterns(mut self, patterns: Vec<Regex>) -> Self {
        self.allow_patterns = patterns;
        self
    }

    #[cfg(test)]
    fn with_docker_probe(mut self, probe: Box<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.docker_probe = probe;
        self
    }

    fn sandbox_is_active(&self) -> bool {
        match self.sandbox_mode {
            SandboxMode::Off => false,
            SandboxMode::All => true,
            SandboxMode::NonMain => self.agent_id != "default",
        }
    }

    /// Best-effort safety guard for destructive commands and workspace
    /// escapes. Returns the rejection message when blocked.
    fn guard_command(&self, command: &str, cwd: &Path) -> Option<String> {
        let lower = command.trim().to_ascii_lowercase();

        for pattern in &self.deny_patterns {
            if pattern.is_match(&lower) {
                return Some(
                    "Error: Command blocked by safety guard (dangerous pattern detected)".into(),
                );
            }
        }

        if !self.allow_patterns.is_empty()
            && !self.allow_patterns.iter().any(|p| p.is_match(&lower))
        {
            return Some("Error: Command blocked by safety guard (not in allowlist)".into());
        }

        if self.restrict_to_workspace {
            if command.contains("../") || command.contains("..\\") {
                return Some(
                    "Error: Command blocked by safety guard (path traversal detected)".into(),
                );
            }
            let path_re = Regex::new(r#"/[^\s"']+"#).unwrap();
            for hit in path_re.find_iter(command) {
                let path = crate::fs::normalize_lexical(Path::new(hit.as_str()));
                let root = crate::fs::normalize_lexical(cwd);
                if path != root && !path.starts_with(&root) {
                    return Some(
                        "Error: Command blocked by safety guard (path outside working dir)".into(),
                    );
                }
            }
        }
        None
    }

    fn format_result(&self, code: i32, stdout: &str, stderr: &str) -> String {
        if code == 124 && stderr.to_ascii_lowercase().contains("timed out") {
            return format!(
                "Error: Command timed out after {} seconds",
                self.timeout.as_secs()
            );
        }

        let mut parts = Vec::new();
        if !stdout.is_empty() {
            parts.push(stdout.to_owned());
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{stderr}"));
        }
        if code != 0 {
            parts.push(format!("\nExit code: {code}"));
        }

        let result = if parts.is_empty() {
            "(no output)".to_owned()
        } else {
            parts.join("\n")
        };
        truncate_with_marker(&result, MAX_RESULT_LEN)
    }
}

fn docker_on_path() -> bool {
    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path).any(|dir| dir.join("docker").is_file())
}

#[async_trait::async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Use with caution."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory for the command"
                }
            },
            "required": ["command"]
        })
    }

    fn set_registry_context(&self, ctx: &ToolContext) {
        *self.session_key.lock() = ctx.session_key.clone();
    }

    async fn execute(&self, params: Value) -> String {
        let command = params.get("command").and_then(Value::as_str).unwrap_or("");
        let cwd: PathBuf = params
            .get("working_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_dir.clone());

        if let Some(rejection) = self.guard_command(command, &cwd) {
            return rejection;
        }

        if self.sandbox_is_active() {
            if !(self.docker_probe)() {
                return "Error: Sandbox is enabled but Docker is unavailable (fail-closed)."
                    .into();
            }
            let sandbox = match &self.sandbox {
                Some(sandbox) => sandbox,
                None => return "Error: Sandbox runtime is not initialized.".into(),
            };
            let ctx = SandboxContext {
                session_key: self.session_key.lock().clone(),
                agent_id: self.agent_id.clone(),
            };
            let (code, stdout, stderr) = sandbox
                .execute(command, &cwd.to_string_lossy(), self.timeout, &ctx)
                .await;
            return self.format_result(code, &stdout, &stderr);
        }

        let args = vec!["sh".to_owned(), "-c".to_owned(), command.to_owned()];
        let (code, stdout, stderr) = self.runner.run(&args, Some(&cwd), self.timeout).await;
        self.format_result(code, &stdout, &stderr)
    }
}
