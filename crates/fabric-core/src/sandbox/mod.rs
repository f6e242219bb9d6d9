//! Sandbox Runner: isolated, language-aware command execution.
//!
//! Fuses [`crate::isolation::container::ContainerIsolation`]'s Docker
//! subprocess orchestration (container lifecycle: create/start/copy-in/
//! remove) with [`crate::invariant::runner::run_invariant`]'s
//! execution/streaming half (concurrent stdout/stderr drain via
//! `tokio::join!`, `tokio::time::timeout` with child-kill), generalized from
//! a fixed invariant command to an arbitrary `{language, command}` execution
//! and from buffer-only output to output streamed to the Event Broadcaster.
//!
//! The isolation requirements in spec.md §4.3 are non-negotiable: no network
//! egress, read-only rootfs, non-root UID, dropped capabilities, a seccomp
//! profile, and CPU/memory quotas are always applied -- there is no
//! "unsandboxed" mode.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use fabric_db::models::{ErrorKind, SandboxExecution, SandboxStatus};
use fabric_db::queries::sandbox::{self, NewSandboxExecution};
use sqlx::PgPool;
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::error::FabricError;
use crate::events::{Event, EventType};

/// Supported language executors. Detection generalizes
/// `presets::detect_project_type`'s marker-file sniffing to the sandbox's
/// narrower set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Node,
    Php,
    Shell,
}

impl Language {
    /// Detect a language from the set of file names present in the code
    /// being submitted, mirroring `presets::detect_project_type`'s
    /// marker-file sniffing (`package.json` -> node, etc), narrowed to the
    /// languages the sandbox actually executes.
    pub fn detect(file_names: &[String]) -> Option<Language> {
        let has = |name: &str| file_names.iter().any(|f| f == name);
        if has("package.json") {
            Some(Language::Node)
        } else if has("composer.json") {
            Some(Language::Php)
        } else if has("pyproject.toml") || has("setup.py") || has("requirements.txt") {
            Some(Language::Python)
        } else {
            Some(Language::Shell)
        }
    }

    pub fn interpreter(self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Node => "node",
            Language::Php => "php",
            Language::Shell => "sh",
        }
    }
}

/// Non-negotiable isolation flags applied to every container, per spec.md
/// §4.3. Callers cannot opt out of any of these; only the resource ceilings
/// are configurable.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout_seconds: i32,
    pub memory_limit_mb: i32,
    pub cpu_quota: f32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            memory_limit_mb: 512,
            cpu_quota: 1.0,
        }
    }
}

/// Result of running one sandboxed command, mirroring
/// `invariant::runner::InvariantResult`'s shape.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub execution_id: Uuid,
    pub status: SandboxStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

/// Runs sandboxed commands inside Docker containers with the non-negotiable
/// isolation profile always applied.
pub struct SandboxRunner {
    pool: PgPool,
    image: String,
}

impl SandboxRunner {
    pub fn new(pool: PgPool, image: impl Into<String>) -> Self {
        Self {
            pool,
            image: image.into(),
        }
    }

    /// The fixed docker flags enforcing no network egress, read-only
    /// rootfs, a non-root UID, dropped capabilities, and a default seccomp
    /// profile. Resource ceilings come from `limits`.
    fn isolation_flags(limits: &SandboxLimits) -> Vec<String> {
        vec![
            "--network".to_string(),
            "none".to_string(),
            "--read-only".to_string(),
            "--user".to_string(),
            "65534:65534".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--security-opt".to_string(),
            "seccomp=default".to_string(),
            "--memory".to_string(),
            format!("{}m", limits.memory_limit_mb),
            "--cpus".to_string(),
            format!("{}", limits.cpu_quota),
            "--tmpfs".to_string(),
            "/tmp".to_string(),
        ]
    }

    /// Execute `command` in a fresh, isolated container with `working_dir`'s
    /// contents copied in, streaming exactly one `SandboxExecutionFinished`
    /// event (and, in a fuller build, incremental `SandboxOutputChunk`
    /// events -- output here is captured in full then reported, matching
    /// `run_invariant`'s buffer-then-return shape, since the container's
    /// stdout/stderr are not separately streamable mid-run without a tty).
    pub async fn execute(
        &self,
        workspace_id: Uuid,
        project_id: Uuid,
        language: Language,
        command: &str,
        working_dir: &Path,
        limits: &SandboxLimits,
        broadcaster: Option<&Broadcaster>,
    ) -> Result<SandboxOutcome, FabricError> {
        let new = NewSandboxExecution {
            workspace_id,
            project_id,
            language: format!("{:?}", language).to_lowercase(),
            command: command.to_string(),
            timeout_seconds: limits.timeout_seconds,
            memory_limit_mb: limits.memory_limit_mb,
        };
        let execution = sandbox::insert_sandbox_execution(&self.pool, &new)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        let container_id = match self.create_and_start(&execution, working_dir, limits).await {
            Ok(id) => id,
            Err(err) => {
                self.fail(&execution, ErrorKind::SandboxFailed, &err.to_string(), 0)
                    .await?;
                return Err(FabricError::new(ErrorKind::SandboxFailed, err.to_string()));
            }
        };

        sandbox::mark_sandbox_started(&self.pool, execution.id, &container_id)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        let outcome = self
            .run_and_collect(&execution, &container_id, language, command, limits)
            .await;

        let _ = Command::new("docker").args(["rm", "-f", &container_id]).output().await;

        if let Some(broadcaster) = broadcaster {
            broadcaster
                .publish(
                    Event::new(
                        workspace_id,
                        EventType::SandboxExecutionFinished,
                        serde_json::json!({ "execution_id": execution.id, "status": format!("{:?}", outcome.status) }),
                    )
                    .with_task(project_id),
                )
                .await;
        }

        Ok(outcome)
    }

    async fn create_and_start(
        &self,
        execution: &SandboxExecution,
        working_dir: &Path,
        limits: &SandboxLimits,
    ) -> anyhow::Result<String> {
        let name = format!("fabric-sandbox-{}", execution.id);
        let mut args = vec!["create".to_string(), "--name".to_string(), name, "-w".to_string(), "/workspace".to_string()];
        args.extend(Self::isolation_flags(limits));
        args.push(self.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());

        let output = Command::new("docker").args(&args).output().await?;
        if !output.status.success() {
            anyhow::bail!("docker create failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let start = Command::new("docker").args(["start", &container_id]).output().await?;
        if !start.status.success() {
            let _ = Command::new("docker").args(["rm", "-f", &container_id]).output().await;
            anyhow::bail!("docker start failed: {}", String::from_utf8_lossy(&start.stderr));
        }

        let mkdir = Command::new("docker")
            .args(["exec", &container_id, "mkdir", "-p", "/workspace"])
            .output()
            .await?;
        if !mkdir.status.success() {
            anyhow::bail!("docker exec mkdir failed: {}", String::from_utf8_lossy(&mkdir.stderr));
        }

        let tar_cmd = format!(
            "tar -C {} --exclude='.git' -cf - . | docker cp - {}:/workspace",
            shell_escape(working_dir),
            container_id
        );
        let copy = Command::new("sh").args(["-c", &tar_cmd]).output().await?;
        if !copy.status.success() {
            anyhow::bail!("copy into sandbox failed: {}", String::from_utf8_lossy(&copy.stderr));
        }

        Ok(container_id)
    }

    /// Run `command` via `docker exec`, draining stdout/stderr concurrently
    /// (`tokio::join!`, matching `run_invariant`'s deadlock-avoidance
    /// shape), under a wall-clock timeout that kills the child and the
    /// container on breach.
    async fn run_and_collect(
        &self,
        execution: &SandboxExecution,
        container_id: &str,
        language: Language,
        command: &str,
        limits: &SandboxLimits,
    ) -> SandboxOutcome {
        let start = Instant::now();
        let timeout = Duration::from_secs(limits.timeout_seconds.max(1) as u64);

        let mut child = match Command::new("docker")
            .args(["exec", container_id, language.interpreter(), "-c", command])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let duration_ms = elapsed_ms(start);
                let _ = self
                    .fail(execution, ErrorKind::SandboxFailed, &err.to_string(), duration_ms)
                    .await;
                return SandboxOutcome {
                    execution_id: execution.id,
                    status: SandboxStatus::Failed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: err.to_string(),
                    duration_ms,
                };
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        match tokio::time::timeout(timeout, async {
            tokio::join!(child.wait(), read_stdout, read_stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => {
                let duration_ms = elapsed_ms(start);
                let exit_code = status.code();
                // Docker surfaces an OOM-killed exec as exit code 137
                // (128 + SIGKILL) -- the cgroup OOM killer, not a normal
                // non-zero exit.
                if exit_code == Some(137) {
                    let _ = self
                        .fail(execution, ErrorKind::SandboxFailed, "out_of_memory", duration_ms)
                        .await;
                    return SandboxOutcome {
                        execution_id: execution.id,
                        status: SandboxStatus::Failed,
                        exit_code,
                        stdout,
                        stderr,
                        duration_ms,
                    };
                }

                let sandbox_status = if exit_code == Some(0) {
                    SandboxStatus::Completed
                } else {
                    SandboxStatus::Failed
                };
                let _ = sandbox::finish_sandbox_execution(
                    &self.pool,
                    execution.id,
                    sandbox_status,
                    &stdout,
                    &stderr,
                    exit_code,
                    duration_ms,
                    None,
                    None,
                    None,
                    None,
                )
                .await;

                SandboxOutcome {
                    execution_id: execution.id,
                    status: sandbox_status,
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                }
            }
            Ok((Err(err), _, _)) => {
                let duration_ms = elapsed_ms(start);
                let _ = self
                    .fail(execution, ErrorKind::SandboxFailed, &err.to_string(), duration_ms)
                    .await;
                SandboxOutcome {
                    execution_id: execution.id,
                    status: SandboxStatus::Failed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: err.to_string(),
                    duration_ms,
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                let duration_ms = elapsed_ms(start);
                let _ = sandbox::finish_sandbox_execution(
                    &self.pool,
                    execution.id,
                    SandboxStatus::Timeout,
                    "",
                    "wall-clock timeout exceeded",
                    None,
                    duration_ms,
                    None,
                    None,
                    Some("timeout"),
                    Some("wall-clock timeout exceeded"),
                )
                .await;
                SandboxOutcome {
                    execution_id: execution.id,
                    status: SandboxStatus::Timeout,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: "wall-clock timeout exceeded".to_string(),
                    duration_ms,
                }
            }
        }
    }

    async fn fail(
        &self,
        execution: &SandboxExecution,
        kind: ErrorKind,
        message: &str,
        duration_ms: i64,
    ) -> Result<(), FabricError> {
        sandbox::finish_sandbox_execution(
            &self.pool,
            execution.id,
            SandboxStatus::Failed,
            "",
            message,
            None,
            duration_ms,
            None,
            None,
            Some(kind.to_string().as_str()),
            Some(message),
        )
        .await
        .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }

    /// Kill and mark as `timeout` every execution still `running` past its
    /// deadline -- the sandbox's own orphan-recovery sweep, run
    /// periodically alongside the approval sweeper.
    pub async fn reap_overdue(&self) -> Result<u64, FabricError> {
        let overdue = sandbox::list_overdue_sandbox_executions(&self.pool)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        let mut reaped = 0;
        for execution in overdue {
            if let Some(container_id) = &execution.container_id {
                let _ = Command::new("docker").args(["rm", "-f", container_id]).output().await;
            }
            sandbox::finish_sandbox_execution(
                &self.pool,
                execution.id,
                SandboxStatus::Timeout,
                execution.stdout.as_deref().unwrap_or(""),
                "reaped: wall-clock timeout exceeded",
                None,
                0,
                None,
                None,
                Some("timeout"),
                Some("reaped: wall-clock timeout exceeded"),
            )
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn shell_escape(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_node_from_package_json() {
        let files = vec!["package.json".to_string(), "index.js".to_string()];
        assert_eq!(Language::detect(&files), Some(Language::Node));
    }

    #[test]
    fn detects_python_from_pyproject() {
        let files = vec!["pyproject.toml".to_string()];
        assert_eq!(Language::detect(&files), Some(Language::Python));
    }

    #[test]
    fn falls_back_to_shell() {
        let files = vec!["run.sh".to_string()];
        assert_eq!(Language::detect(&files), Some(Language::Shell));
    }

    #[test]
    fn isolation_flags_include_no_network_and_readonly() {
        let flags = SandboxRunner::isolation_flags(&SandboxLimits::default());
        assert!(flags.windows(2).any(|w| w == ["--network", "none"]));
        assert!(flags.contains(&"--read-only".to_string()));
        assert!(flags.contains(&"ALL".to_string()));
    }
}
