//! Subprocess-backed implementations of the three ports `fabric-core`
//! leaves abstract: [`LlmPort`], [`Agent`], and [`StepExecutor`].
//!
//! None of the three has a concrete implementation inside `fabric-core`
//! itself -- per spec.md §9 they are pure interfaces the crate is tested
//! against with fakes. The CLI is the operator-facing edge that has to
//! actually run something, so it supplies process adapters grounded in the
//! same subprocess shape `sandbox::SandboxRunner` and `git::GitCoordinator`
//! already use: `tokio::process::Command`, a `tokio::time::timeout` raced
//! against the child's exit, and a kill on breach or cancellation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use fabric_core::agents::{Agent, AgentOutcome};
use fabric_core::error::FabricError;
use fabric_core::executor::llm::{CompletionRequest, CompletionResponse, LlmPort};
use fabric_core::workflow::{StepExecutor, StepOutcome};
use fabric_db::models::{ErrorKind, WorkflowExecution, WorkflowStep, WorkflowStepExecution};

/// Default wall-clock ceiling for a shelled-out command before it is killed.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Run `program` with `args`, feeding `stdin_data` on its stdin if present,
/// racing its exit against `timeout` and `cancel`. Mirrors
/// `SandboxRunner::run_and_collect`'s concurrent stdout/stderr drain and
/// kill-on-breach shape, minus the Docker container wrapper.
async fn run_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    stdin_data: Option<&str>,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<(i32, String, String), FabricError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if stdin_data.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| FabricError::new(ErrorKind::Internal, format!("failed to spawn {program}: {e}")))?;

    if let Some(data) = stdin_data {
        use tokio::io::AsyncWriteExt;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data.as_bytes()).await;
        }
    }

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

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(FabricError::cancelled(format!("{program} cancelled")))
        }
        result = tokio::time::timeout(timeout, async { tokio::join!(child.wait(), read_stdout, read_stderr) }) => {
            match result {
                Ok((Ok(status), stdout, stderr)) => Ok((status.code().unwrap_or(-1), stdout, stderr)),
                Ok((Err(e), _, _)) => Err(FabricError::new(ErrorKind::Internal, format!("{program} wait failed: {e}"))),
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Err(FabricError::deadline_exceeded(format!("{program} exceeded {}s", timeout.as_secs())))
                }
            }
        }
    }
}

/// Shells out to a configured command (e.g. a thin wrapper script around a
/// hosted completion API) that reads a JSON-encoded [`CompletionRequest`] on
/// stdin and writes a JSON-encoded [`CompletionResponse`] on stdout. Keeps
/// the provider itself out of the binary -- operators point this at
/// whatever completion command they have credentials for.
pub struct ProcessLlmPort {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessLlmPort {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl LlmPort for ProcessLlmPort {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, FabricError> {
        let stdin_payload = serde_json::to_string(&serde_json::json!({
            "prompt": request.prompt,
            "model": request.model,
            "max_tokens": request.max_tokens,
        }))
        .map_err(|e| FabricError::new(ErrorKind::Internal, format!("failed to encode completion request: {e}")))?;

        let (exit_code, stdout, stderr) = run_command(
            &self.program,
            &self.args,
            None,
            Some(&stdin_payload),
            self.timeout,
            CancellationToken::new(),
        )
        .await?;

        if exit_code != 0 {
            return Err(FabricError::new(
                ErrorKind::LlmFailed,
                format!("{} exited {exit_code}: {stderr}", self.program),
            ));
        }

        let parsed: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| FabricError::new(ErrorKind::LlmFailed, format!("unparseable completion output: {e}")))?;

        Ok(CompletionResponse {
            text: parsed["text"].as_str().unwrap_or_default().to_string(),
            tokens_in: parsed["tokens_in"].as_u64().unwrap_or(0),
            tokens_out: parsed["tokens_out"].as_u64().unwrap_or(0),
            cost_estimate: parsed["cost_estimate"].as_f64().unwrap_or(0.0),
        })
    }
}

/// Runs a fixed command-line agent (a coding-agent CLI invoked non-
/// interactively) with the prompt piped to stdin, in `cwd`. The agent's
/// exit code and combined stdout become the [`AgentOutcome`].
pub struct ProcessAgent {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessAgent {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        cancel: CancellationToken,
    ) -> anyhow::Result<AgentOutcome> {
        let (exit_code, stdout, stderr) = run_command(
            &self.program,
            &self.args,
            Some(cwd),
            Some(prompt),
            self.timeout,
            cancel,
        )
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

        let summary = if stdout.trim().is_empty() { stderr } else { stdout };
        Ok(AgentOutcome { exit_code, summary })
    }
}

/// Drives a workflow's `task` and `agent` steps by shelling out: `task`
/// steps run `step.config.command` directly, `agent` steps dispatch to a
/// registered [`ProcessAgent`] by `step.config.agent` name. `condition`,
/// `parallel`, `sequential`, and `approval` steps carry no executable body
/// of their own -- the engine resolves them before ever calling a
/// [`StepExecutor`], so reaching this impl for one of those types is a
/// workflow-definition bug, not a runtime condition to recover from.
pub struct ProcessStepExecutor {
    agents: Vec<ProcessAgent>,
    default_timeout: Duration,
}

impl ProcessStepExecutor {
    pub fn new(agents: Vec<ProcessAgent>) -> Self {
        Self {
            agents,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    fn find_agent(&self, name: &str) -> Option<&ProcessAgent> {
        self.agents.iter().find(|a| a.name() == name)
    }
}

#[async_trait]
impl StepExecutor for ProcessStepExecutor {
    async fn run_step(
        &self,
        step: &WorkflowStep,
        _step_execution: &WorkflowStepExecution,
        _execution: &WorkflowExecution,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, FabricError> {
        use fabric_db::models::StepType;

        match step.step_type {
            StepType::Task => {
                let Some(command) = step.config.get("command").and_then(|v| v.as_str()) else {
                    return Ok(StepOutcome::Failed {
                        kind: ErrorKind::InvalidInput,
                        message: format!("step {} has no config.command", step.name),
                    });
                };
                match run_command("sh", &["-c".to_string(), command.to_string()], None, None, self.default_timeout, cancel).await {
                    Ok((0, stdout, _)) => Ok(StepOutcome::Completed {
                        output: serde_json::json!({ "stdout": stdout }),
                    }),
                    Ok((code, stdout, stderr)) => Ok(StepOutcome::Failed {
                        kind: ErrorKind::Internal,
                        message: format!("command exited {code}: stdout={stdout} stderr={stderr}"),
                    }),
                    Err(err) => Ok(StepOutcome::Failed {
                        kind: err.kind,
                        message: err.message,
                    }),
                }
            }
            StepType::Agent => {
                let Some(agent_name) = step.config.get("agent").and_then(|v| v.as_str()) else {
                    return Ok(StepOutcome::Failed {
                        kind: ErrorKind::InvalidInput,
                        message: format!("step {} has no config.agent", step.name),
                    });
                };
                let Some(agent) = self.find_agent(agent_name) else {
                    return Ok(StepOutcome::Failed {
                        kind: ErrorKind::InvalidInput,
                        message: format!("no registered agent named {agent_name}"),
                    });
                };
                let prompt = step
                    .config
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let cwd = std::env::current_dir()
                    .map_err(|e| FabricError::new(ErrorKind::Internal, format!("no cwd: {e}")))?;
                match agent.execute(prompt, &cwd, cancel).await {
                    Ok(outcome) if outcome.exit_code == 0 => Ok(StepOutcome::Completed {
                        output: serde_json::json!({ "summary": outcome.summary }),
                    }),
                    Ok(outcome) => Ok(StepOutcome::Failed {
                        kind: ErrorKind::Internal,
                        message: format!("agent exited {}: {}", outcome.exit_code, outcome.summary),
                    }),
                    Err(err) => Ok(StepOutcome::Failed {
                        kind: ErrorKind::Internal,
                        message: err.to_string(),
                    }),
                }
            }
            other => Ok(StepOutcome::Failed {
                kind: ErrorKind::InvalidInput,
                message: format!("step type {other:?} has no executable body; this step should never reach a StepExecutor"),
            }),
        }
    }
}
