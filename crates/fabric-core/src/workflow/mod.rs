//! Workflow Engine: define a step DAG, run it to completion with
//! continuous-readiness scheduling, and react to external approval
//! responses and cancellation.
//!
//! Generalizes [`crate::orchestrator::run_orchestrator`]'s scheduling loop
//! (semaphore-bounded concurrency, an mpsc channel of completions,
//! cancellation with a timed drain, ready-work spawning) from "a flat list
//! of tasks gated by `depends_on` names resolved once at plan-parse time"
//! to "a persisted step DAG whose readiness frontier is recomputed from the
//! database on every iteration" via
//! [`fabric_db::queries::workflow_executions::get_ready_step_executions`].
//! DAG validation reuses [`crate::plan::parser::check_for_cycles`]'s Kahn's
//! algorithm, ported in [`validate`]. The on-disk step-DAG format in
//! [`toml_format`] generalizes [`crate::plan::toml_format`]'s task list to a
//! typed step list.

pub mod toml_format;
pub mod validate;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fabric_db::models::{
    ErrorKind, ExecutionStatus, OnFailure, StepType, Workflow, WorkflowExecution, WorkflowStep,
    WorkflowStepExecution,
};
use fabric_db::queries::{workflow_executions as exec_db, workflows as workflow_db};

use crate::error::FabricError;
use crate::events::{Event, EventType};
use crate::broadcaster::Broadcaster;

pub use toml_format::{StepToml, WorkflowMeta, WorkflowToml};
pub use validate::{parse_workflow_toml, WorkflowValidationError};

/// How long the cancellation path waits for in-flight steps to finish on
/// their own before giving up on the drain and returning. Resolves the
/// "what is the cancellation grace period" open question: 30 seconds.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// The outcome of one step's execution, independent of its step type.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { output: serde_json::Value },
    Failed { kind: ErrorKind, message: String },
}

/// Pluggable step-execution backend. The engine owns scheduling, retries,
/// and failure propagation; the executor just knows how to run one step's
/// payload (a task script, an agent prompt, a condition expression...) and
/// report back. Approval steps are handled by the engine itself, never
/// dispatched here, since they resolve asynchronously and possibly outside
/// the lifetime of any one scheduling loop invocation.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run_step(
        &self,
        step: &WorkflowStep,
        step_execution: &WorkflowStepExecution,
        execution: &WorkflowExecution,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, FabricError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn StepExecutor) {}
};

/// Result of driving an execution's scheduler loop to a stopping point.
/// Distinct from [`ExecutionStatus`]: the loop can stop because it is
/// waiting on a human (not a DB status of its own) as well as for the
/// execution's own terminal statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Failed,
    Cancelled,
    /// No step is ready, none is in flight, and at least one pending
    /// approval step is awaiting a human response.
    AwaitingApproval,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] WorkflowValidationError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

fn max_retry_attempts(retry_policy: &serde_json::Value) -> i32 {
    retry_policy
        .get("max_attempts")
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32
}

fn retry_policy_json(max_attempts: i32) -> serde_json::Value {
    serde_json::json!({ "max_attempts": max_attempts })
}

/// One step's message back to the scheduler loop.
struct StepDone {
    step: WorkflowStep,
    step_execution_id: Uuid,
    outcome: Result<StepOutcome, FabricError>,
}

/// DAG definition, run, and scheduling operations over a workflow.
pub struct WorkflowEngine {
    pool: PgPool,
    max_parallel: usize,
}

impl WorkflowEngine {
    pub fn new(pool: PgPool, max_parallel: usize) -> Self {
        Self { pool, max_parallel }
    }

    /// `ValidateWorkflow`: parse and check a workflow definition without
    /// persisting anything.
    pub fn validate_workflow(&self, toml_content: &str) -> Result<WorkflowToml, WorkflowValidationError> {
        parse_workflow_toml(toml_content)
    }

    /// Validate, then persist the workflow, its steps, and its dependency
    /// edges. Step order is preserved from the TOML's declaration order.
    pub async fn define_workflow(
        &self,
        workspace_id: Uuid,
        project_id: Uuid,
        toml_content: &str,
    ) -> Result<Workflow, WorkflowError> {
        let parsed = self.validate_workflow(toml_content)?;

        let workflow =
            workflow_db::insert_workflow(&self.pool, workspace_id, project_id, &parsed.workflow.name)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        let mut ids_by_name: HashMap<String, Uuid> = HashMap::new();
        for (order, step) in parsed.steps.iter().enumerate() {
            let step_type = StepType::from_str(&step.step_type)
                .expect("step_type already validated by validate_workflow");
            let on_failure = match step.on_failure.as_str() {
                "continue" => OnFailure::Continue,
                _ => OnFailure::Abort,
            };
            let config = serde_json::to_value(&step.config)
                .map_err(|e| FabricError::invalid_input(format!("step {} has unencodable config: {e}", step.name)))?;

            let row = workflow_db::insert_workflow_step(
                &self.pool,
                workflow.id,
                &step.name,
                step_type,
                order as i32,
                &config,
                &retry_policy_json(step.retry.max_attempts),
                on_failure,
            )
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

            ids_by_name.insert(step.name.clone(), row.id);
        }

        for step in &parsed.steps {
            let step_id = ids_by_name[&step.name];
            for dep_name in &step.depends_on {
                let dep_id = ids_by_name[dep_name];
                workflow_db::insert_step_dependency(&self.pool, step_id, dep_id)
                    .await
                    .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
            }
        }

        Ok(workflow)
    }

    /// `StartExecution`: seed a new run of the workflow's DAG and drive it
    /// until it completes, fails, is cancelled, or stalls on a pending
    /// approval.
    pub async fn start_execution(
        &self,
        workflow_id: Uuid,
        input_variables: serde_json::Value,
        executor: Arc<dyn StepExecutor>,
        broadcaster: Option<Broadcaster>,
        cancel: CancellationToken,
    ) -> Result<(WorkflowExecution, DriveOutcome), FabricError> {
        let execution = exec_db::insert_workflow_execution(&self.pool, workflow_id, &input_variables)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        exec_db::transition_execution_status(
            &self.pool,
            execution.id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
        )
        .await
        .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        if let Some(b) = broadcaster.as_ref() {
            b.publish(Event::new(
                Uuid::nil(),
                EventType::WorkflowExecutionStarted,
                serde_json::json!({"workflow_id": workflow_id, "execution_id": execution.id}),
            ))
            .await;
        }

        let outcome = self
            .drive(workflow_id, execution.id, executor, broadcaster, cancel)
            .await?;
        Ok((execution, outcome))
    }

    /// `RespondToApproval`: called by the caller once a human has replied
    /// to an approval gate. Resumes the scheduler so downstream steps that
    /// were waiting on this one can become ready.
    #[allow(clippy::too_many_arguments)]
    pub async fn respond_to_approval(
        &self,
        workflow_id: Uuid,
        execution_id: Uuid,
        step_execution_id: Uuid,
        approved: bool,
        executor: Arc<dyn StepExecutor>,
        broadcaster: Option<Broadcaster>,
        cancel: CancellationToken,
    ) -> Result<DriveOutcome, FabricError> {
        let (from, to) = if approved {
            (ExecutionStatus::Running, ExecutionStatus::Completed)
        } else {
            (ExecutionStatus::Running, ExecutionStatus::Failed)
        };

        let rows = exec_db::transition_step_execution_status(&self.pool, step_execution_id, from, to)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        if rows == 0 {
            return Err(FabricError::conflict(format!(
                "step execution {step_execution_id} was not awaiting a response"
            )));
        }

        if !approved {
            let step_execution = exec_db::get_step_execution(&self.pool, step_execution_id)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?
                .ok_or_else(|| FabricError::not_found(format!("step execution {step_execution_id} not found")))?;
            exec_db::skip_downstream_steps(&self.pool, execution_id, step_execution.step_id)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
        }

        self.drive(workflow_id, execution_id, executor, broadcaster, cancel).await
    }

    /// `CancelExecution`: mark every non-terminal step execution cancelled
    /// and fail the run. Called directly for an immediate cancel, or from
    /// [`Self::drive`]'s cancellation path after giving in-flight steps
    /// [`CANCEL_DRAIN_GRACE`] to finish on their own first.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), FabricError> {
        exec_db::cancel_pending_step_executions(&self.pool, execution_id)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        exec_db::fail_execution(&self.pool, execution_id, ErrorKind::Cancelled, "execution cancelled")
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
        exec_db::transition_execution_status(
            &self.pool,
            execution_id,
            ExecutionStatus::Running,
            ExecutionStatus::Cancelled,
        )
        .await
        .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        Ok(())
    }

    /// The continuous-readiness scheduler: recompute the DAG's ready
    /// frontier every iteration rather than scheduling in fixed layers, so
    /// a fast-finishing sibling can unblock its dependents without waiting
    /// for the rest of its layer. Ready non-approval steps are spawned
    /// concurrently up to `max_parallel`, mirroring the semaphore/mpsc
    /// shape of the task orchestrator this generalizes.
    async fn drive(
        &self,
        workflow_id: Uuid,
        execution_id: Uuid,
        executor: Arc<dyn StepExecutor>,
        broadcaster: Option<Broadcaster>,
        cancel: CancellationToken,
    ) -> Result<DriveOutcome, FabricError> {
        let steps = workflow_db::list_steps_for_workflow(&self.pool, workflow_id)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
        let steps_by_id: HashMap<Uuid, WorkflowStep> =
            steps.into_iter().map(|s| (s.id, s)).collect();

        let semaphore = Arc::new(Semaphore::new(self.max_parallel.max(1)));
        let (tx, mut rx) = mpsc::channel::<StepDone>(self.max_parallel.max(1) * 2);
        let mut in_flight: usize = 0;
        let mut aborted = false;

        loop {
            if cancel.is_cancelled() {
                let deadline = tokio::time::Instant::now() + CANCEL_DRAIN_GRACE;
                while in_flight > 0 {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(done)) => {
                            in_flight -= 1;
                            self.handle_step_done(execution_id, done, broadcaster.as_ref()).await;
                        }
                        _ => break,
                    }
                }
                self.cancel_execution(execution_id).await?;
                return Ok(DriveOutcome::Cancelled);
            }

            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                if matches!(
                    self.handle_step_done(execution_id, done, broadcaster.as_ref()).await,
                    Some(true)
                ) {
                    aborted = true;
                }
            }

            if exec_db::is_execution_complete(&self.pool, execution_id)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?
            {
                let status = if aborted {
                    ExecutionStatus::Failed
                } else {
                    ExecutionStatus::Completed
                };
                exec_db::transition_execution_status(&self.pool, execution_id, ExecutionStatus::Running, status)
                    .await
                    .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
                if let Some(b) = broadcaster.as_ref() {
                    b.publish(Event::new(
                        Uuid::nil(),
                        EventType::WorkflowExecutionCompleted,
                        serde_json::json!({"execution_id": execution_id, "status": status.to_string()}),
                    ))
                    .await;
                }
                return Ok(if aborted { DriveOutcome::Failed } else { DriveOutcome::Completed });
            }

            let ready = exec_db::get_ready_step_executions(&self.pool, execution_id)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

            let mut spawned_any = false;
            let mut awaiting_approval = false;

            for step_execution in ready {
                let Some(step) = steps_by_id.get(&step_execution.step_id).cloned() else {
                    continue;
                };

                if step.step_type == StepType::Approval {
                    // Approval steps resolve out-of-band via
                    // `respond_to_approval`; mark running and stop tracking
                    // them here.
                    let rows = exec_db::transition_step_execution_status(
                        &self.pool,
                        step_execution.id,
                        ExecutionStatus::Pending,
                        ExecutionStatus::Running,
                    )
                    .await
                    .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
                    if rows > 0 {
                        awaiting_approval = true;
                        if let Some(b) = broadcaster.as_ref() {
                            b.publish(Event::new(
                                Uuid::nil(),
                                EventType::ApprovalRequested,
                                serde_json::json!({
                                    "execution_id": execution_id,
                                    "step_execution_id": step_execution.id,
                                }),
                            ))
                            .await;
                        }
                    }
                    continue;
                }

                let rows = exec_db::transition_step_execution_status(
                    &self.pool,
                    step_execution.id,
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                )
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
                if rows == 0 {
                    continue;
                }
                spawned_any = true;

                if let Some(b) = broadcaster.as_ref() {
                    b.publish(Event::new(
                        Uuid::nil(),
                        EventType::StepExecutionStarted,
                        serde_json::json!({
                            "execution_id": execution_id,
                            "step_execution_id": step_execution.id,
                            "step_name": step.name,
                        }),
                    ))
                    .await;
                }

                let execution = exec_db::get_workflow_execution(&self.pool, execution_id)
                    .await
                    .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?
                    .ok_or_else(|| FabricError::not_found(format!("execution {execution_id} not found")))?;

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                in_flight += 1;

                let tx_clone = tx.clone();
                let executor_clone = Arc::clone(&executor);
                let step_clone = step.clone();
                let step_execution_clone = step_execution.clone();
                let step_cancel = cancel.clone();

                tokio::spawn(async move {
                    let outcome = executor_clone
                        .run_step(&step_clone, &step_execution_clone, &execution, step_cancel)
                        .await;
                    drop(permit);
                    let done = StepDone {
                        step: step_clone,
                        step_execution_id: step_execution_clone.id,
                        outcome,
                    };
                    let _ = tx_clone.send(done).await;
                });
            }

            if awaiting_approval && !spawned_any && in_flight == 0 {
                while let Ok(done) = rx.try_recv() {
                    self.handle_step_done(execution_id, done, broadcaster.as_ref()).await;
                }
                return Ok(DriveOutcome::AwaitingApproval);
            }

            if in_flight > 0 {
                tokio::select! {
                    done = rx.recv() => {
                        if let Some(done) = done {
                            in_flight -= 1;
                            if matches!(
                                self.handle_step_done(execution_id, done, broadcaster.as_ref()).await,
                                Some(true)
                            ) {
                                aborted = true;
                            }
                        }
                    }
                    _ = cancel.cancelled() => { continue; }
                }
            } else if !spawned_any && !awaiting_approval {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                    _ = cancel.cancelled() => { continue; }
                }
            }
        }
    }

    /// Handle one step's reported outcome: persist it, retry if eligible,
    /// or fail the step and skip its transitive downstream. Returns
    /// `Some(true)` when this failure should abort the whole execution.
    async fn handle_step_done(
        &self,
        execution_id: Uuid,
        done: StepDone,
        broadcaster: Option<&Broadcaster>,
    ) -> Option<bool> {
        match done.outcome {
            Ok(StepOutcome::Completed { output }) => {
                let _ = exec_db::set_step_execution_output(&self.pool, done.step_execution_id, &output).await;
                let _ = exec_db::transition_step_execution_status(
                    &self.pool,
                    done.step_execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::Completed,
                )
                .await;
                if let Some(b) = broadcaster {
                    b.publish(Event::new(
                        Uuid::nil(),
                        EventType::StepExecutionCompleted,
                        serde_json::json!({
                            "execution_id": execution_id,
                            "step_execution_id": done.step_execution_id,
                            "status": "completed",
                        }),
                    ))
                    .await;
                }
                None
            }
            Ok(StepOutcome::Failed { kind, message }) | Err(FabricError { kind, message }) => {
                self.fail_step(execution_id, &done.step, done.step_execution_id, kind, &message, broadcaster)
                    .await
            }
        }
    }

    async fn fail_step(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        step_execution_id: Uuid,
        kind: ErrorKind,
        message: &str,
        broadcaster: Option<&Broadcaster>,
    ) -> Option<bool> {
        let max_attempts = max_retry_attempts(&step.retry_policy);
        let retry_count = exec_db::increment_step_retry(&self.pool, step_execution_id)
            .await
            .unwrap_or(max_attempts + 1);

        if retry_count <= max_attempts {
            let _ = exec_db::transition_step_execution_status(
                &self.pool,
                step_execution_id,
                ExecutionStatus::Running,
                ExecutionStatus::Pending,
            )
            .await;
            return None;
        }

        let _ = exec_db::fail_step_execution(&self.pool, step_execution_id, kind, message).await;
        let _ = exec_db::skip_downstream_steps(&self.pool, execution_id, step.id).await;

        if let Some(b) = broadcaster {
            b.publish(Event::new(
                Uuid::nil(),
                EventType::StepExecutionCompleted,
                serde_json::json!({
                    "execution_id": execution_id,
                    "step_execution_id": step_execution_id,
                    "status": "failed",
                    "error": message,
                }),
            ))
            .await;
        }

        Some(step.on_failure == OnFailure::Abort)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, FabricError> {
        exec_db::get_workflow_execution(&self.pool, execution_id)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?
            .ok_or_else(|| FabricError::not_found(format!("workflow execution {execution_id} not found")))
    }
}

pub type SharedWorkflowEngine = Arc<WorkflowEngine>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_retry_attempts_defaults_to_zero() {
        assert_eq!(max_retry_attempts(&serde_json::json!({})), 0);
        assert_eq!(max_retry_attempts(&serde_json::json!({"max_attempts": 3})), 3);
    }

    #[test]
    fn retry_policy_json_roundtrips() {
        let v = retry_policy_json(2);
        assert_eq!(max_retry_attempts(&v), 2);
    }
}
