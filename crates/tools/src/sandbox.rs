//! Long-lived Docker sandbox containers keyed by scope.
//!
//! Containers are created hardened (`--read-only`, no network, all caps
//! dropped, non-root, pid/memory limits, tmpfs mounts) and reused across
//! commands within their scope. A missing or stopped container is recreated
//! and the command retried once. Idle and aged containers are pruned before
//! each use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use courier_domain::config::{ExecResourceLimits, SandboxConfig, SandboxScope, WorkspaceAccess};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs an argv with a timeout, returning (exit_code, stdout, stderr).
/// Abstracted so tests can fake the docker CLI.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String], cwd: Option<&Path>, timeout: Duration)
        -> (i32, String, String);
}

pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> (i32, String, String) {
        let (program, rest) = match args.split_first() {
            Some(split) => split,
            None => return (1, String::new(), "empty command".into()),
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return (1, String::new(), e.to_string()),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => (
                output.status.code().unwrap_or(0),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ),
            Ok(Err(e)) => (1, String::new(), e.to_string()),
            Err(_) => (
                124,
                String::new(),
                format!("Command timed out after {} seconds", timeout.as_secs()),
            ),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execution context used to select the container scope.
#[derive(Debug, Clone, Default)]
pub struct SandboxContext {
    pub session_key: String,
    pub agent_id: String,
}

struct ContainerRecord {
    name: String,
    created_at: Instant,
    last_used_at: Instant,
}

pub struct DockerSandbox {
    image: String,
    scope: SandboxScope,
    workspace_access: WorkspaceAccess,
    workspace_root: PathBuf,
    limits: ExecResourceLimits,
    prune_idle: Duration,
    prune_max_age: Duration,
    containers: Mutex<HashMap<String, ContainerRecord>>,
    runner: Arc<dyn CommandRunner>,
}

impl DockerSandbox {
    pub fn new(
        config: &SandboxConfig,
        workspace_root: PathBuf,
        limits: ExecResourceLimits,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            image: config.image.clone(),
            scope: config.scope,
            workspace_access: config.workspace_access,
            workspace_root,
            limits,
            prune_idle: Duration::from_secs(config.prune_idle_seconds.max(30)),
            prune_max_age: Duration::from_secs(config.prune_max_age_seconds.max(60)),
            containers: Mutex::new(HashMap::new()),
            runner,
        }
    }

    /// Run a command in the scope's container, creating it on demand and
    /// retrying once when the container has gone away.
    pub async fn execute(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
        ctx: &SandboxContext,
    ) -> (i32, String, String) {
        let scope_key = self.scope_key(ctx);
        let name = {
            let mut containers = self.containers.lock().await;
            self.prune_locked(&mut containers).await;
            match self.ensure_container_locked(&mut containers, &scope_key, cwd).await {
                Ok(name) => name,
                Err(detail) => {
                    return (1, String::new(), format!("Docker sandbox container start failed: {detail}"));
                }
            }
        };

        let payload = self.build_limited_payload(command, cwd);
        let exec_args = Self::build_exec_args(&name, &payload);
        let (mut code, mut stdout, mut stderr) =
            self.runner.run(&exec_args, None, timeout).await;

        if code != 0 && Self::should_recreate(&stderr) {
            let name = {
                let mut containers = self.containers.lock().await;
                self.remove_scope_container_locked(&mut containers, &scope_key).await;
                match self.ensure_container_locked(&mut containers, &scope_key, cwd).await {
                    Ok(name) => name,
                    Err(detail) => {
                        return (1, String::new(), format!("Docker sandbox container start failed: {detail}"));
                    }
                }
            };
            let exec_args = Self::build_exec_args(&name, &payload);
            (code, stdout, stderr) = self.runner.run(&exec_args, None, timeout).await;
        }

        if let Some(record) = self.containers.lock().await.get_mut(&scope_key) {
            record.last_used_at = Instant::now();
        }
        (code, stdout, stderr)
    }

    fn scope_key(&self, ctx: &SandboxContext) -> String {
        let agent = if ctx.agent_id.trim().is_empty() {
            "default"
        } else {
            ctx.agent_id.trim()
        };
        match self.scope {
            SandboxScope::Shared => "shared".to_owned(),
            SandboxScope::Agent => format!("agent:{agent}"),
            SandboxScope::Session => {
                let session = if ctx.session_key.trim().is_empty() {
                    "default"
                } else {
                    ctx.session_key.trim()
                };
                format!("session:{agent}:{session}")
            }
        }
    }

    async fn ensure_container_locked(
        &self,
        containers: &mut HashMap<String, ContainerRecord>,
        scope_key: &str,
        cwd: &str,
    ) -> Result<String, String> {
        if let Some(record) = containers.get_mut(scope_key) {
            if self.is_container_running(&record.name).await {
                record.last_used_at = Instant::now();
                return Ok(record.name.clone());
            }
            let stale = containers.remove(scope_key).unwrap();
            self.remove_container(&stale.name).await;
        }

        let name = Self::container_name(scope_key);
        self.remove_container(&name).await;
        let args = self.build_run_args(&name, scope_key, cwd);
        let (code, stdout, stderr) = self
            .runner
            .run(&args, None, Duration::from_secs(30))
            .await;
        if code != 0 {
            let detail = if !stderr.trim().is_empty() {
                stderr.trim().to_owned()
            } else if !stdout.trim().is_empty() {
                stdout.trim().to_owned()
            } else {
                "unknown docker error".to_owned()
            };
            return Err(detail);
        }

        let now = Instant::now();
        containers.insert(
            scope_key.to_owned(),
            ContainerRecord {
                name: name.clone(),
                created_at: now,
                last_used_at: now,
            },
        );
        Ok(name)
    }

    async fn remove_scope_container_locked(
        &self,
        containers: &mut HashMap<String, ContainerRecord>,
        scope_key: &str,
    ) {
        if let Some(record) = containers.remove(scope_key) {
            self.remove_container(&record.name).await;
        }
    }

    async fn prune_locked(&self, containers: &mut HashMap<String, ContainerRecord>) {
        let now = Instant::now();
        let stale: Vec<String> = containers
            .iter()
            .filter(|(_, record)| {
                now.duration_since(record.last_used_at) >= self.prune_idle
                    || now.duration_since(record.created_at) >= self.prune_max_age
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.remove_scope_container_locked(containers, &key).await;
        }
    }

    async fn is_container_running(&self, name: &str) -> bool {
        let args = vec_of(&["docker", "inspect", "-f", "{{.State.Running}}", name]);
        let (code, stdout, _) = self
            .runner
            .run(&args, None, Duration::from_secs(8))
            .await;
        code == 0 && stdout.trim().eq_ignore_ascii_case("true")
    }

    async fn remove_container(&self, name: &str) {
        let args = vec_of(&["docker", "rm", "-f", name]);
        let _ = self.runner.run(&args, None, Duration::from_secs(8)).await;
    }

    fn build_run_args(&self, container_name: &str, scope_key: &str, cwd: &str) -> Vec<String> {
        let tmp_size_mb = self.limits.file_size_mb.max(16);
        let mem_mb = self.limits.memory_mb.max(64);
        let pids = self.limits.max_processes.max(4);
        let workdir = self.container_cwd(cwd);

        let mut args = vec_of(&[
            "docker",
            "run",
            "-d",
            "--name",
            container_name,
            "--read-only",
            "--network",
            "none",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges:true",
            "--pids-limit",
            &pids.to_string(),
            "--memory",
            &format!("{mem_mb}m"),
            "--tmpfs",
            &format!("/tmp:rw,nosuid,nodev,noexec,size={tmp_size_mb}m"),
            "--tmpfs",
            "/run:rw,nosuid,nodev,noexec,size=16m",
            "--user",
            "65532:65532",
            "--workdir",
            &workdir,
            "--label",
            "courier.sandbox=true",
            "--label",
            &format!("courier.scope_key={}", Self::short_hash(scope_key)),
        ]);

        match self.workspace_access {
            WorkspaceAccess::Ro | WorkspaceAccess::Rw => {
                let access = if self.workspace_access == WorkspaceAccess::Ro {
                    "ro"
                } else {
                    "rw"
                };
                args.push("-v".into());
                args.push(format!(
                    "{}:/workspace:{access}",
                    self.workspace_root.display()
                ));
            }
            WorkspaceAccess::None => {
                args.push("--tmpfs".into());
                args.push("/workspace:rw,nosuid,nodev,noexec,size=64m".into());
            }
        }

        args.push(self.image.clone());
        args.extend(vec_of(&[
            "/bin/sh",
            "-lc",
            "while true; do sleep 3600; done",
        ]));
        args
    }

    fn build_exec_args(container_name: &str, payload: &str) -> Vec<String> {
        vec_of(&["docker", "exec", "-i", container_name, "/bin/sh", "-lc", payload])
    }

    fn container_cwd(&self, cwd: &str) -> String {
        if self.workspace_access == WorkspaceAccess::None {
            return "/workspace".into();
        }
        let requested = Path::new(cwd);
        match requested.strip_prefix(&self.workspace_root) {
            Ok(rel) => {
                let rel = rel.to_string_lossy();
                if rel.is_empty() || rel == "." {
                    "/workspace".into()
                } else {
                    format!("/workspace/{rel}")
                }
            }
            Err(_) => "/workspace".into(),
        }
    }

    /// Build the ulimit prelude + cd + command payload run inside the
    /// container.
    fn build_limited_payload(&self, command: &str, cwd: &str) -> String {
        let cwd_q = shell_quote(&self.container_cwd(cwd));
        [
            "set -e".to_owned(),
            format!("ulimit -t {}", self.limits.cpu_seconds),
            format!("ulimit -v {}", self.limits.memory_mb * 1024),
            format!("ulimit -f {}", self.limits.file_size_mb * 2048),
            format!("ulimit -u {}", self.limits.max_processes),
            format!("mkdir -p {cwd_q}"),
            format!("cd {cwd_q}"),
            command.to_owned(),
        ]
        .join("; ")
    }

    fn should_recreate(stderr: &str) -> bool {
        let lower = stderr.to_ascii_lowercase();
        ["no such container", "is not running", "container not found"]
            .iter()
            .any(|marker| lower.contains(marker))
    }

    fn container_name(scope_key: &str) -> String {
        format!("courier-sbx-{}", Self::short_hash(scope_key))
    }

    fn short_hash(value: &str) -> String {
        let digest = Sha256::digest(value.as_bytes());
        hex::encode(&digest[..6])
    }
}

fn vec_of(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

/// Minimal POSIX single-quote escaping for the cd target.
fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'))
    {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    fn limits() -> ExecResourceLimits {
        ExecResourceLimits {
            cpu_seconds: 2,
            memory_mb: 128,
            file_size_mb: 8,
            max_processes: 16,
        }
    }

    fn config(scope: SandboxScope, access: WorkspaceAccess) -> SandboxConfig {
        SandboxConfig {
            mode: courier_domain::config::SandboxMode::All,
            scope,
            workspace_access: access,
            image: "courier-sandbox:bookworm-slim".into(),
            prune_idle_seconds: 60,
            prune_max_age_seconds: 300,
        }
    }

    /// Fake docker CLI: first inspect reports a missing container, later
    /// inspects report running; records every invocation.
    pub(super) struct FakeDocker {
        pub calls: SyncMutex<Vec<Vec<String>>>,
        pub run_count: SyncMutex<usize>,
    }

    impl FakeDocker {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: SyncMutex::new(Vec::new()),
                run_count: SyncMutex::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeDocker {
        async fn run(
            &self,
            args: &[String],
            _cwd: Option<&Path>,
            _timeout: Duration,
        ) -> (i32, String, String) {
            self.calls.lock().push(args.to_vec());
            let head: Vec<&str> = args.iter().take(3).map(String::as_str).collect();
            match head.as_slice() {
                ["docker", "inspect", "-f"] => {
                    if *self.run_count.lock() > 0 {
                        (0, "true\n".into(), String::new())
                    } else {
                        (1, String::new(), "No such container".into())
                    }
                }
                ["docker", "run", "-d"] => {
                    *self.run_count.lock() += 1;
                    (0, "container-id\n".into(), String::new())
                }
                ["docker", "exec", "-i"] => (0, "ok\n".into(), String::new()),
                _ => (0, String::new(), String::new()),
            }
        }
    }

    #[test]
    fn run_args_hardening_rw_workspace() {
        let root = PathBuf::from("/tmp/ws");
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Agent, WorkspaceAccess::Rw),
            root.clone(),
            limits(),
            Arc::new(ProcessRunner),
        );
        let args = sandbox.build_run_args("sandbox-rw", "agent:default", "/tmp/ws");
        let joined = args.join(" ");
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges:true"));
        assert!(joined.contains("--user 65532:65532"));
        assert!(joined.contains("--pids-limit 16"));
        assert!(joined.contains("--memory 128m"));
        assert!(joined.contains(&format!("-v {}:/workspace:rw", root.display())));
    }

    #[test]
    fn run_args_no_workspace_uses_tmpfs() {
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Agent, WorkspaceAccess::None),
            PathBuf::from("/tmp/ws"),
            limits(),
            Arc::new(ProcessRunner),
        );
        let args = sandbox.build_run_args("sandbox-none", "agent:default", "/tmp/ws");
        let joined = args.join(" ");
        assert!(joined.contains("/workspace:rw,nosuid,nodev,noexec"));
        assert!(!joined.contains("-v "));
    }

    #[test]
    fn payload_has_ulimits_and_cd() {
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Session, WorkspaceAccess::Ro),
            PathBuf::from("/tmp/ws"),
            limits(),
            Arc::new(ProcessRunner),
        );
        let payload = sandbox.build_limited_payload("echo hi", "/tmp/ws");
        assert!(payload.contains("ulimit -t 2"));
        assert!(payload.contains("ulimit -v 131072"));
        assert!(payload.contains("ulimit -f 16384"));
        assert!(payload.contains("ulimit -u 16"));
        assert!(payload.contains("cd /workspace"));
        assert!(payload.ends_with("echo hi"));
    }

    #[test]
    fn scope_keys() {
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Session, WorkspaceAccess::Ro),
            PathBuf::from("/tmp/ws"),
            limits(),
            Arc::new(ProcessRunner),
        );
        let ctx = SandboxContext {
            session_key: "telegram:42".into(),
            agent_id: "helper".into(),
        };
        assert_eq!(sandbox.scope_key(&ctx), "session:helper:telegram:42");

        let shared = DockerSandbox::new(
            &config(SandboxScope::Shared, WorkspaceAccess::Ro),
            PathBuf::from("/tmp/ws"),
            limits(),
            Arc::new(ProcessRunner),
        );
        assert_eq!(shared.scope_key(&ctx), "shared");
    }

    #[test]
    fn container_cwd_translates_workspace_relative() {
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Agent, WorkspaceAccess::Rw),
            PathBuf::from("/tmp/ws"),
            limits(),
            Arc::new(ProcessRunner),
        );
        assert_eq!(sandbox.container_cwd("/tmp/ws"), "/workspace");
        assert_eq!(sandbox.container_cwd("/tmp/ws/sub/dir"), "/workspace/sub/dir");
        assert_eq!(sandbox.container_cwd("/elsewhere"), "/workspace");
    }

    #[tokio::test]
    async fn shared_scope_reuses_single_container() {
        let fake = FakeDocker::new();
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Shared, WorkspaceAccess::Rw),
            PathBuf::from("/tmp/ws"),
            limits(),
            fake.clone(),
        );
        let ctx = SandboxContext {
            session_key: "telegram:42".into(),
            agent_id: "default".into(),
        };

        let (code1, out1, _) = sandbox
            .execute("echo first", "/tmp/ws", Duration::from_secs(5), &ctx)
            .await;
        let (code2, out2, _) = sandbox
            .execute("echo second", "/tmp/ws", Duration::from_secs(5), &ctx)
            .await;

        assert_eq!((code1, code2), (0, 0));
        assert!(out1.contains("ok"));
        assert!(out2.contains("ok"));
        assert_eq!(*fake.run_count.lock(), 1);
        let calls = fake.calls.lock();
        let exec_calls = calls
            .iter()
            .filter(|c| c.len() >= 3 && c[0] == "docker" && c[1] == "exec" && c[2] == "-i")
            .count();
        assert_eq!(exec_calls, 2);
        // The exec prelude carries ulimits and the workspace cd.
        let exec = calls
            .iter()
            .find(|c| c.get(1).map(String::as_str) == Some("exec"))
            .unwrap();
        let payload = exec.last().unwrap();
        assert!(payload.contains("ulimit -v 131072"));
        assert!(payload.contains("cd /workspace"));
    }

    #[tokio::test]
    async fn missing_container_stderr_triggers_recreate() {
        struct FlakyDocker {
            exec_attempts: SyncMutex<usize>,
            run_count: SyncMutex<usize>,
        }

        #[async_trait::async_trait]
        impl CommandRunner for FlakyDocker {
            async fn run(
                &self,
                args: &[String],
                _cwd: Option<&Path>,
                _timeout: Duration,
            ) -> (i32, String, String) {
                let head: Vec<&str> = args.iter().take(3).map(String::as_str).collect();
                match head.as_slice() {
                    ["docker", "inspect", "-f"] => (1, String::new(), "No such container".into()),
                    ["docker", "run", "-d"] => {
                        *self.run_count.lock() += 1;
                        (0, "id\n".into(), String::new())
                    }
                    ["docker", "exec", "-i"] => {
                        let mut attempts = self.exec_attempts.lock();
                        *attempts += 1;
                        if *attempts == 1 {
                            (1, String::new(), "Error: No such container: x".into())
                        } else {
                            (0, "recovered\n".into(), String::new())
                        }
                    }
                    _ => (0, String::new(), String::new()),
                }
            }
        }

        let runner = Arc::new(FlakyDocker {
            exec_attempts: SyncMutex::new(0),
            run_count: SyncMutex::new(0),
        });
        let sandbox = DockerSandbox::new(
            &config(SandboxScope::Shared, WorkspaceAccess::Rw),
            PathBuf::from("/tmp/ws"),
            limits(),
            runner.clone(),
        );

        let (code, stdout, _) = sandbox
            .execute(
                "echo x",
                "/tmp/ws",
                Duration::from_secs(5),
                &SandboxContext::default(),
            )
            .await;
        assert_eq!(code, 0);
        assert!(stdout.contains("recovered"));
        // First run for creation, second for the retry after recreation.
        assert_eq!(*runner.run_count.lock(), 2);
    }
}
