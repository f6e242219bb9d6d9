//! Task Executor: the per-task `RunTask` pipeline -- analyze, plan, await
//! approval, execute with a bounded revision loop, finalize git state, and
//! always clean up local worktree state.
//!
//! Fuses three teacher pieces: [`crate::lifecycle::run_agent_lifecycle`]'s
//! shape (workspace -> materialize -> assign -> run -> collect -> gate,
//! generalized here to analyze -> plan -> execute -> review), the verdict
//! split in [`crate::gate::evaluator::evaluate_verdict`] (`GateAction`
//! generalized into [`ReviewOutcome`], a plain sum type replacing the
//! source's exception-driven control flow per spec.md §9), and
//! `gate::truncate_snippet`'s feedback-truncation discipline. Everything
//! else -- budget, git, agent dispatch, sandbox, events -- is the ambient
//! ports this module calls through.

pub mod llm;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fabric_db::models::{ErrorKind, GitStatus, RunPhase, Task, TaskRun};
use fabric_db::queries::{task_runs as run_db, tasks as task_db};

use crate::agents::{AgentRuntimeRegistry, Controller};
use crate::broadcaster::Broadcaster;
use crate::budget::{compute_budget, CostTracker, Usage};
use crate::error::FabricError;
use crate::events::{Event, EventType};
use crate::git::GitCoordinator;
use crate::sandbox::{Language, SandboxLimits, SandboxRunner};
use crate::worktree::WorktreeInfo;

pub use llm::{CompletionRequest, CompletionResponse, LlmPort};

const LLM_MAX_RETRIES: u32 = 3;
const FEEDBACK_SNIPPET_BYTES: usize = 2048;

fn internal(e: anyhow::Error) -> FabricError {
    FabricError::new(ErrorKind::Internal, e.to_string())
}

/// A UTF-8-boundary-safe truncation, same discipline as
/// `gate::truncate_snippet`, applied here to revision feedback folded back
/// into the next round's prompt.
fn truncate_feedback_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

/// Complexity bucket the analyze phase assigns a run, driving the planning
/// round budget and the cost ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Xs,
    S,
    M,
    L,
    Xl,
}

impl Complexity {
    fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "XS" => Complexity::Xs,
            "S" => Complexity::S,
            "M" => Complexity::M,
            "L" => Complexity::L,
            "XL" => Complexity::Xl,
            _ => Complexity::M,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Complexity::Xs => "XS",
            Complexity::S => "S",
            Complexity::M => "M",
            Complexity::L => "L",
            Complexity::Xl => "XL",
        }
    }

    /// Planning round budget per spec.md §4.1 step 3, before the task's own
    /// `max_rounds` ceiling is applied.
    fn max_rounds(self) -> i32 {
        match self {
            Complexity::Xs => 1,
            Complexity::S => 2,
            Complexity::M => 3,
            Complexity::L => 4,
            Complexity::Xl => 5,
        }
    }

    /// Cost multiplier folded into `compute_budget`. Not pinned down by any
    /// spec formula beyond "complexity_factor" -- chosen to scale with
    /// `max_rounds` since both track the same analyze-phase estimate; see
    /// DESIGN.md.
    fn factor(self) -> f64 {
        match self {
            Complexity::Xs => 1.0,
            Complexity::S => 1.5,
            Complexity::M => 2.0,
            Complexity::L => 3.0,
            Complexity::Xl => 5.0,
        }
    }
}

/// Generalizes `gate::GateVerdict`/`gate::evaluator::GateAction` into a
/// plain sum type the revision loop matches on, per spec.md §9.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved,
    ChangesRequired { notes: String },
}

/// `lowercase, non-alphanumerics -> '-', consecutive '-' collapsed, trimmed
/// to <= 50 chars, no leading/trailing '-'`, per spec.md §4.1 step 5. Same
/// sanitize discipline as `worktree`'s branch-name handling and
/// `isolation::container`'s docker-name sanitizer.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for c in name.chars() {
        let lower = c.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            out.push(lower);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    let truncated: String = trimmed.chars().take(50).collect();
    truncated.trim_end_matches('-').to_string()
}

fn hash_notes(notes: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    notes.hash(&mut hasher);
    hasher.finish()
}

/// Result of a `RunTask`/`ApprovePlan` call: either the run suspended
/// waiting on a human decision, or it ran through to a terminal phase.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub phase: RunPhase,
}

/// Tunables not carried on `Task` itself -- the LLM model/token ceiling and
/// the budget formula's base/multiplier inputs.
#[derive(Debug, Clone)]
pub struct TaskExecutorConfig {
    pub base_budget: f64,
    pub budget_multiplier: f64,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            base_budget: 1.0,
            budget_multiplier: 1.0,
            model: "default".to_string(),
            max_tokens: 4096,
        }
    }
}

/// Drives a [`Task`]'s runs through the full phase state machine. Holds no
/// per-run state of its own -- every run's progress lives in `task_runs`,
/// so a crashed-and-restarted executor recovers via
/// `queries::task_runs::reset_orphaned_runs` rather than any in-memory
/// bookkeeping here.
pub struct TaskExecutor {
    pool: PgPool,
    llm: Arc<dyn LlmPort>,
    agents: Arc<Controller>,
    runtimes: Arc<AgentRuntimeRegistry>,
    git: Option<GitCoordinator>,
    sandbox: Option<SandboxRunner>,
    broadcaster: Option<Broadcaster>,
    config: TaskExecutorConfig,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        llm: Arc<dyn LlmPort>,
        agents: Arc<Controller>,
        runtimes: Arc<AgentRuntimeRegistry>,
        git: Option<GitCoordinator>,
        sandbox: Option<SandboxRunner>,
        broadcaster: Option<Broadcaster>,
        config: TaskExecutorConfig,
    ) -> Self {
        Self {
            pool,
            llm,
            agents,
            runtimes,
            git,
            sandbox,
            broadcaster,
            config,
        }
    }

    async fn emit(&self, task: &Task, run_id: Uuid, data: serde_json::Value) {
        if let Some(b) = &self.broadcaster {
            b.publish(
                Event::new(task.workspace_id, EventType::TaskRunPhaseChanged, data)
                    .with_task(task.id)
                    .with_run(run_id),
            )
            .await;
        }
    }

    /// Atomically move a run from `from` to `to`, failing with `Conflict` if
    /// a concurrent caller already moved it. `started_at` is stamped on the
    /// very first transition out of `created`; `completed_at` is stamped
    /// whenever `to` is terminal.
    async fn transition(
        &self,
        task: &Task,
        run_id: Uuid,
        from: RunPhase,
        to: RunPhase,
    ) -> Result<(), FabricError> {
        let started_at = matches!(from, RunPhase::Created).then(chrono::Utc::now);
        let completed_at = to.is_terminal().then(chrono::Utc::now);
        let rows = run_db::transition_run_phase(&self.pool, run_id, from, to, started_at, completed_at)
            .await
            .map_err(internal)?;
        if rows == 0 {
            return Err(FabricError::conflict(format!(
                "run {run_id} is not in phase {from} (concurrent transition?)"
            )));
        }
        self.emit(task, run_id, serde_json::json!({"to": to.to_string()})).await;
        Ok(())
    }

    /// Record a terminal failure, mapping the error kind to the matching
    /// terminal phase (`cancelled`/`timeout`/`failed`).
    async fn fail_run(&self, task: &Task, run_id: Uuid, err: &FabricError) {
        let phase = match err.kind {
            ErrorKind::Cancelled => RunPhase::Cancelled,
            ErrorKind::DeadlineExceeded => RunPhase::Timeout,
            _ => RunPhase::Failed,
        };
        if let Err(e) = run_db::fail_run(&self.pool, run_id, phase, err.kind, &err.message).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to record run failure");
        }
        if let Err(e) = task_db::mark_run_finished(&self.pool, task.id, false).await {
            tracing::warn!(task_id = %task.id, error = %e, "failed to update task run counters");
        }
        let event = match phase {
            RunPhase::Cancelled => "task.cancelled",
            RunPhase::Timeout => "task.timeout",
            _ => "task.failed",
        };
        self.emit(
            task,
            run_id,
            serde_json::json!({"event": event, "error_kind": err.kind.to_string(), "message": err.message}),
        )
        .await;
    }

    async fn allocate_run(&self, task: &Task) -> Result<TaskRun, FabricError> {
        if run_db::get_active_run_for_task(&self.pool, task.id)
            .await
            .map_err(internal)?
            .is_some()
        {
            return Err(FabricError::conflict(format!(
                "task {} already has a run in progress",
                task.id
            )));
        }

        let run = run_db::insert_task_run(&self.pool, task.id, task.workspace_id, task.project_id)
            .await
            .map_err(|e| {
                if e.to_string().contains("duplicate key") {
                    FabricError::conflict(format!("task {} already has a run in progress", task.id))
                } else {
                    internal(e)
                }
            })?;

        task_db::mark_run_started(&self.pool, task.id).await.map_err(internal)?;
        Ok(run)
    }

    /// `RunTask`: allocate a run and drive it through analyze/plan, then
    /// either continue straight through execute/finalize (auto-approved
    /// plans) or suspend at `awaiting_approval`.
    pub async fn run_task(&self, task: &Task, cancel: CancellationToken) -> Result<RunOutcome, FabricError> {
        let run = self.allocate_run(task).await?;
        self.emit(
            task,
            run.id,
            serde_json::json!({"event": "task.started", "run_number": run.run_number}),
        )
        .await;

        match self.analyze_and_plan(task, &run, cancel.clone()).await {
            Ok(PlanOutcome::Suspended) => Ok(RunOutcome {
                run_id: run.id,
                phase: RunPhase::AwaitingApproval,
            }),
            Ok(PlanOutcome::Ready { max_revision_rounds, budget }) => {
                match self
                    .execute_through_completion(task, run.clone(), max_revision_rounds, budget, cancel)
                    .await
                {
                    Ok(outcome) => Ok(outcome),
                    Err(err) => {
                        self.fail_run(task, run.id, &err).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.fail_run(task, run.id, &err).await;
                Err(err)
            }
        }
    }

    /// `ApprovePlan`: resume a run suspended at `awaiting_approval`.
    pub async fn approve_plan(&self, task: &Task, run: TaskRun, cancel: CancellationToken) -> Result<RunOutcome, FabricError> {
        self.transition(task, run.id, RunPhase::AwaitingApproval, RunPhase::Executing)
            .await?;

        let plan = run.plan.clone().unwrap_or_else(|| serde_json::json!({}));
        let complexity = Complexity::from_label(plan.get("complexity").and_then(|v| v.as_str()).unwrap_or("M"));
        let budget = CostTracker::new(compute_budget(
            self.config.base_budget,
            self.config.budget_multiplier,
            complexity.factor(),
        ));

        let run_id = run.id;
        match self
            .execute_through_completion(task, run, task.max_revision_rounds, budget, cancel)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail_run(task, run_id, &err).await;
                Err(err)
            }
        }
    }

    /// `RejectPlan`: terminate a run suspended at `awaiting_approval` without
    /// ever reaching execute.
    pub async fn reject_plan(&self, task: &Task, run_id: Uuid, reason: &str) -> Result<(), FabricError> {
        let rows = run_db::fail_run(&self.pool, run_id, RunPhase::PlanRejected, ErrorKind::InvalidInput, reason)
            .await
            .map_err(internal)?;
        if rows == 0 {
            return Err(FabricError::conflict(format!("run {run_id} already resolved")));
        }
        task_db::mark_run_finished(&self.pool, task.id, false).await.map_err(internal)?;
        self.emit(
            task,
            run_id,
            serde_json::json!({"event": "task.failed", "error_kind": "invalid_input", "reason": reason}),
        )
        .await;
        Ok(())
    }

    /// `CancelExecution` equivalent for a single run: fails the run as
    /// `cancelled` regardless of its current non-terminal phase.
    pub async fn cancel_run(&self, task: &Task, run_id: Uuid) -> Result<(), FabricError> {
        let rows = run_db::fail_run(
            &self.pool,
            run_id,
            RunPhase::Cancelled,
            ErrorKind::Cancelled,
            "run cancelled by caller",
        )
        .await
        .map_err(internal)?;
        if rows == 0 {
            return Err(FabricError::conflict(format!("run {run_id} already resolved")));
        }
        task_db::mark_run_finished(&self.pool, task.id, false).await.map_err(internal)?;
        self.emit(task, run_id, serde_json::json!({"event": "task.cancelled"})).await;
        Ok(())
    }

    async fn analyze_and_plan(&self, task: &Task, run: &TaskRun, cancel: CancellationToken) -> Result<PlanOutcome, FabricError> {
        self.transition(task, run.id, RunPhase::Created, RunPhase::Analyzing).await?;

        // The real budget ceiling depends on the complexity this call is
        // about to produce, so the analyze call itself runs against a
        // provisional M-tier ceiling; its cost is folded into the real
        // tracker once complexity is known.
        let provisional = CostTracker::new(compute_budget(
            self.config.base_budget,
            self.config.budget_multiplier,
            Complexity::M.factor(),
        ));
        let complexity = self.analyze(task, &provisional, cancel.clone()).await?;

        let budget = CostTracker::new(compute_budget(
            self.config.base_budget,
            self.config.budget_multiplier,
            complexity.factor(),
        ));
        budget.record(provisional.spent().await).await?;

        self.transition(task, run.id, RunPhase::Analyzing, RunPhase::Planning).await?;
        let max_rounds = complexity.max_rounds().min(task.max_rounds.max(1));
        let plan = self.plan(task, complexity, max_rounds, &budget, cancel.clone()).await?;
        run_db::set_run_plan(&self.pool, run.id, &plan).await.map_err(internal)?;

        let auto_approve = task
            .config
            .get("auto_approve_plan")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !auto_approve {
            self.transition(task, run.id, RunPhase::Planning, RunPhase::AwaitingApproval)
                .await?;
            self.emit(task, run.id, serde_json::json!({"event": "plan_ready"})).await;
            return Ok(PlanOutcome::Suspended);
        }

        self.transition(task, run.id, RunPhase::Planning, RunPhase::Executing).await?;
        Ok(PlanOutcome::Ready {
            max_revision_rounds: task.max_revision_rounds,
            budget,
        })
    }

    async fn analyze(&self, task: &Task, budget: &CostTracker, cancel: CancellationToken) -> Result<Complexity, FabricError> {
        if cancel.is_cancelled() {
            return Err(FabricError::cancelled("run cancelled before analyze phase"));
        }
        let prompt = format!(
            "Estimate the complexity of this task and answer with exactly one of XS, S, M, L, XL.\n\nTask: {}\n{}",
            task.name, task.description
        );
        let response = self
            .call_llm(CompletionRequest {
                prompt,
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
            })
            .await?;
        budget
            .record(Usage {
                tokens_in: response.tokens_in,
                tokens_out: response.tokens_out,
                cost: response.cost_estimate,
            })
            .await?;
        Ok(Complexity::from_label(&response.text))
    }

    async fn plan(
        &self,
        task: &Task,
        complexity: Complexity,
        max_rounds: i32,
        budget: &CostTracker,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, FabricError> {
        if cancel.is_cancelled() {
            return Err(FabricError::cancelled("run cancelled before planning phase"));
        }
        let prompt = format!(
            "Produce a step-by-step plan for engineer/tester/reviewer roles to complete \"{}\" within {} round(s).\n\n{}",
            task.name, max_rounds, task.description
        );
        let response = self
            .call_llm(CompletionRequest {
                prompt,
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
            })
            .await?;
        budget
            .record(Usage {
                tokens_in: response.tokens_in,
                tokens_out: response.tokens_out,
                cost: response.cost_estimate,
            })
            .await?;

        Ok(serde_json::json!({
            "complexity": complexity.label(),
            "max_rounds": max_rounds,
            "steps": response.text,
        }))
    }

    async fn call_llm(&self, request: CompletionRequest) -> Result<CompletionResponse, FabricError> {
        let mut attempt = 0;
        loop {
            match self.llm.complete(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt + 1 < LLM_MAX_RETRIES => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    tracing::warn!(attempt, error = %err, "llm call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(FabricError::new(ErrorKind::LlmFailed, err.message)),
            }
        }
    }

    async fn execute_through_completion(
        &self,
        task: &Task,
        run: TaskRun,
        max_revision_rounds: i32,
        budget: CostTracker,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, FabricError> {
        let run_id = run.id;
        let worktree = self.git_setup(task, &run).await;

        let result = self
            .execute_with_revisions(task, &run, worktree.as_ref(), max_revision_rounds, &budget, cancel)
            .await;

        // Cleanup always runs, regardless of outcome, per spec.md §4.1 step 8.
        if let (Some(info), Some(git)) = (&worktree, &self.git) {
            if let Err(e) = git.cleanup(info) {
                tracing::warn!(run_id = %run_id, error = %e, "worktree cleanup failed (non-fatal)");
            }
        }

        let round_count = result?;

        self.transition(task, run_id, RunPhase::Reviewing, RunPhase::Completing).await?;
        self.finalize_git(task, &run, worktree.as_ref()).await;
        self.transition(task, run_id, RunPhase::Completing, RunPhase::Completed).await?;
        run_db::set_run_results(&self.pool, run_id, &serde_json::json!({"status": "completed"}), round_count)
            .await
            .map_err(internal)?;
        task_db::mark_run_finished(&self.pool, task.id, true).await.map_err(internal)?;
        self.emit(task, run_id, serde_json::json!({"event": "task.completed"})).await;

        Ok(RunOutcome {
            run_id,
            phase: RunPhase::Completed,
        })
    }

    /// The execute phase proper: one main round followed by up to
    /// `max_revision_rounds` revisions. `max_revision_rounds` is checked
    /// before the identical-review-hash comparison on every iteration, per
    /// the resolved precedence in DESIGN.md -- round exhaustion is reported
    /// consistently even when the final verdict also happens to repeat the
    /// previous one verbatim.
    async fn execute_with_revisions(
        &self,
        task: &Task,
        run: &TaskRun,
        worktree: Option<&WorktreeInfo>,
        max_revision_rounds: i32,
        budget: &CostTracker,
        cancel: CancellationToken,
    ) -> Result<i32, FabricError> {
        let cwd = worktree.map(|w| w.path.clone()).unwrap_or_else(|| PathBuf::from("."));

        self.run_engineer_and_tester(task, run, &cwd, "", cancel.clone()).await?;
        self.transition(task, run.id, RunPhase::Executing, RunPhase::Reviewing).await?;
        let mut outcome = self.run_reviewer(task, &cwd, cancel.clone()).await?;

        let mut revision_round = 0i32;
        let mut previous_hash: Option<u64> = None;

        while let ReviewOutcome::ChangesRequired { notes } = &outcome {
            if cancel.is_cancelled() {
                return Err(FabricError::cancelled("run cancelled during revision loop"));
            }

            let hash = hash_notes(notes);

            if revision_round >= max_revision_rounds {
                return Err(FabricError::new(
                    ErrorKind::Internal,
                    format!(
                        "revision loop exhausted after {revision_round} round(s) without approval: {}",
                        truncate_feedback_snippet(notes, FEEDBACK_SNIPPET_BYTES)
                    ),
                ));
            }
            if previous_hash == Some(hash) {
                return Err(FabricError::new(
                    ErrorKind::Internal,
                    format!(
                        "reviewer repeated an identical verdict; halting after {revision_round} round(s): {}",
                        truncate_feedback_snippet(notes, FEEDBACK_SNIPPET_BYTES)
                    ),
                ));
            }
            previous_hash = Some(hash);

            let feedback = truncate_feedback_snippet(notes, FEEDBACK_SNIPPET_BYTES);
            revision_round += 1;
            self.transition(task, run.id, RunPhase::Reviewing, RunPhase::Revising).await?;
            self.transition(task, run.id, RunPhase::Revising, RunPhase::Executing).await?;

            self.run_engineer_and_tester(task, run, &cwd, &feedback, cancel.clone()).await?;
            self.transition(task, run.id, RunPhase::Executing, RunPhase::Reviewing).await?;
            outcome = self.run_reviewer(task, &cwd, cancel.clone()).await?;
            let _ = budget.spent().await;
        }

        Ok(revision_round)
    }

    async fn dispatch_agent(&self, role: &str, prompt: &str, cwd: &Path, cancel: CancellationToken) -> Result<crate::agents::AgentOutcome, FabricError> {
        let assignment = self.agents.assign(&[role.to_string()], &[]).await?;
        let runtime = self.runtimes.get(&assignment.instance.name).ok_or_else(|| {
            FabricError::not_found(format!(
                "no registered runtime for agent instance {}",
                assignment.instance.name
            ))
        });

        let result = match runtime {
            Ok(runtime) => runtime
                .execute(prompt, cwd, cancel)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = self.agents.release(assignment.instance.id).await {
            tracing::warn!(instance_id = %assignment.instance.id, error = %e, "failed to release agent instance");
        }

        result
    }

    async fn run_engineer_and_tester(
        &self,
        task: &Task,
        run: &TaskRun,
        cwd: &Path,
        feedback: &str,
        cancel: CancellationToken,
    ) -> Result<(), FabricError> {
        let mut prompt = format!("Task: {}\n\n{}", task.name, task.description);
        if !feedback.is_empty() {
            prompt.push_str(&format!("\n\nPrevious review feedback:\n{feedback}"));
        }

        self.dispatch_agent("engineer", &prompt, cwd, cancel.clone()).await?;
        self.dispatch_agent("tester", &prompt, cwd, cancel.clone()).await?;

        // Sandbox test execution is optional and never fatal: a failing
        // command surfaces as part of what the reviewer inspects, not as a
        // run error.
        if let Some(sandbox) = &self.sandbox {
            if let Some(command) = task.config.get("test_command").and_then(|v| v.as_str()) {
                if let Some(language) = Language::detect(&[]) {
                    if let Err(e) = sandbox
                        .execute(
                            task.workspace_id,
                            task.project_id,
                            language,
                            command,
                            cwd,
                            &SandboxLimits::default(),
                            self.broadcaster.as_ref(),
                        )
                        .await
                    {
                        tracing::warn!(run_id = %run.id, error = %e, "sandbox test run failed (non-blocking)");
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_reviewer(&self, task: &Task, cwd: &Path, cancel: CancellationToken) -> Result<ReviewOutcome, FabricError> {
        let prompt = format!("Review the changes made for task \"{}\" and respond APPROVED or CHANGES_REQUIRED with notes.", task.name);
        let outcome = self.dispatch_agent("reviewer", &prompt, cwd, cancel).await?;
        Ok(parse_review_outcome(&outcome))
    }

    async fn git_setup(&self, task: &Task, run: &TaskRun) -> Option<WorktreeInfo> {
        let git = self.git.as_ref()?;
        let prefix = task.branch_prefix.as_deref().unwrap_or("fabric");
        let branch_name = GitCoordinator::branch_name(prefix, &slug(&task.name), run.run_number);

        match git.prepare_worktree(&branch_name) {
            Ok(info) => {
                if let Err(e) = run_db::update_run_git_status(
                    &self.pool,
                    run.id,
                    GitStatus::BranchCreated,
                    Some(&branch_name),
                    None,
                    None,
                )
                .await
                {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to record branch_created status");
                }
                self.emit(
                    task,
                    run.id,
                    serde_json::json!({"event": "git_branch_created", "branch_name": branch_name}),
                )
                .await;
                Some(info)
            }
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "git setup failed (non-fatal)");
                self.emit(
                    task,
                    run.id,
                    serde_json::json!({"event": "git_operation_failed", "stage": "setup", "error": e.to_string()}),
                )
                .await;
                None
            }
        }
    }

    /// `Finalize`: stage/commit, push, and open a PR, each independently
    /// non-fatal -- a failure at any step is logged and reported as an
    /// event, never propagated as a run error, per spec.md §4.4's failure
    /// semantics table.
    async fn finalize_git(&self, task: &Task, run: &TaskRun, worktree: Option<&WorktreeInfo>) {
        let (Some(git), Some(info)) = (&self.git, worktree) else {
            return;
        };

        if !has_uncommitted_changes(&info.path) {
            return;
        }

        let commit_template = task
            .commit_template
            .as_deref()
            .unwrap_or("[fabric] {task_name} (run #{run_number})");
        let message = commit_template
            .replace("{task_name}", &task.name)
            .replace("{run_number}", &run.run_number.to_string());

        let commit_sha = match git.stage_and_commit(&info.path, &message).await {
            Ok(sha) => sha,
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "commit failed (non-fatal)");
                self.emit(
                    task,
                    run.id,
                    serde_json::json!({"event": "git_operation_failed", "stage": "commit", "error": e.to_string()}),
                )
                .await;
                return;
            }
        };
        let _ = run_db::update_run_git_status(&self.pool, run.id, GitStatus::Committed, None, Some(&commit_sha), None).await;
        self.emit(
            task,
            run.id,
            serde_json::json!({"event": "git_commit_created", "commit_sha": commit_sha}),
        )
        .await;

        let Some(branch_name) = info.branch.clone() else {
            return;
        };

        if let Err(e) = git.push(&info.path, &branch_name).await {
            tracing::warn!(run_id = %run.id, error = %e, "push failed (non-fatal)");
            self.emit(
                task,
                run.id,
                serde_json::json!({"event": "git_operation_failed", "stage": "push", "error": e.to_string()}),
            )
            .await;
            return;
        }
        let _ = run_db::update_run_git_status(&self.pool, run.id, GitStatus::Pushed, None, None, None).await;
        self.emit(task, run.id, serde_json::json!({"event": "git_push_success"})).await;

        let title = format!("MGX: {} - Run #{}", task.name, run.run_number);
        match git.open_pull_request(&info.path, &title, &message, "main").await {
            Ok(pr) => {
                let _ = run_db::update_run_git_status(&self.pool, run.id, GitStatus::PrOpened, None, None, Some(&pr.url)).await;
                self.emit(
                    task,
                    run.id,
                    serde_json::json!({"event": "pull_request_opened", "pr_url": pr.url}),
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "pull request creation failed (non-fatal)");
                self.emit(
                    task,
                    run.id,
                    serde_json::json!({"event": "git_operation_failed", "stage": "pr", "error": e.to_string()}),
                )
                .await;
            }
        }
    }
}

enum PlanOutcome {
    Suspended,
    Ready { max_revision_rounds: i32, budget: CostTracker },
}

fn parse_review_outcome(outcome: &crate::agents::AgentOutcome) -> ReviewOutcome {
    let summary = outcome.summary.trim();
    if summary.to_ascii_uppercase().starts_with("APPROVED") {
        ReviewOutcome::Approved
    } else {
        ReviewOutcome::ChangesRequired {
            notes: outcome.summary.clone(),
        }
    }
}

fn has_uncommitted_changes(path: &Path) -> bool {
    match std::process::Command::new("git").args(["status", "--porcelain"]).current_dir(path).output() {
        Ok(out) => !String::from_utf8_lossy(&out.stdout).trim().is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_lowercases_and_dashes_punctuation() {
        assert_eq!(slug("Add OAuth Support!"), "add-oauth-support");
    }

    #[test]
    fn slug_collapses_consecutive_separators() {
        assert_eq!(slug("foo___bar   baz"), "foo-bar-baz");
    }

    #[test]
    fn slug_has_no_leading_or_trailing_dash() {
        assert_eq!(slug("--weird--name--"), "weird-name");
    }

    #[test]
    fn slug_is_bounded_to_fifty_chars() {
        let long = "a".repeat(200);
        let s = slug(&long);
        assert!(s.len() <= 50);
    }

    #[test]
    fn slug_truncation_never_leaves_a_trailing_dash() {
        let input = format!("{}-{}", "x".repeat(49), "y".repeat(10));
        let s = slug(&input);
        assert!(s.len() <= 50);
        assert!(!s.ends_with('-'));
    }

    #[test]
    fn slug_is_idempotent() {
        let input = "Some / Weird..Name 42";
        let once = slug(input);
        let twice = slug(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn slug_output_charset_is_lowercase_alphanumeric_or_dash() {
        let s = slug("MixedCASE_123!!!end");
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!s.contains("--"));
    }

    #[test]
    fn complexity_max_rounds_matches_tier_mapping() {
        assert_eq!(Complexity::Xs.max_rounds(), 1);
        assert_eq!(Complexity::S.max_rounds(), 2);
        assert_eq!(Complexity::M.max_rounds(), 3);
        assert_eq!(Complexity::L.max_rounds(), 4);
        assert_eq!(Complexity::Xl.max_rounds(), 5);
    }

    #[test]
    fn complexity_from_label_roundtrips() {
        for label in ["XS", "S", "M", "L", "XL"] {
            assert_eq!(Complexity::from_label(label).label(), label);
        }
    }

    #[test]
    fn complexity_from_unknown_label_defaults_to_medium() {
        assert_eq!(Complexity::from_label("banana"), Complexity::M);
    }

    #[test]
    fn review_outcome_parses_approved_case_insensitively() {
        let outcome = crate::agents::AgentOutcome {
            exit_code: 0,
            summary: "approved, looks good".to_string(),
        };
        assert_eq!(parse_review_outcome(&outcome), ReviewOutcome::Approved);
    }

    #[test]
    fn review_outcome_parses_changes_required() {
        let outcome = crate::agents::AgentOutcome {
            exit_code: 0,
            summary: "CHANGES_REQUIRED: missing tests".to_string(),
        };
        assert_eq!(
            parse_review_outcome(&outcome),
            ReviewOutcome::ChangesRequired {
                notes: "CHANGES_REQUIRED: missing tests".to_string()
            }
        );
    }

    #[test]
    fn feedback_snippet_truncates_at_utf8_boundary() {
        let s = "a".repeat(5000);
        let truncated = truncate_feedback_snippet(&s, FEEDBACK_SNIPPET_BYTES);
        assert!(truncated.len() <= FEEDBACK_SNIPPET_BYTES + 3);
        assert!(truncated.ends_with("..."));
    }
}
