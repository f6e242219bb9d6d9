//! Database query functions for `workflow_executions` and
//! `workflow_step_executions`: one run through a workflow's DAG.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ErrorKind, ExecutionStatus, WorkflowExecution, WorkflowStepExecution};

/// Start a new execution of a workflow, at `execution_number` one past the
/// workflow's current highest, and seed a pending step-execution row for
/// every step in the DAG.
pub async fn insert_workflow_execution(
    pool: &PgPool,
    workflow_id: Uuid,
    input_variables: &serde_json::Value,
) -> Result<WorkflowExecution> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let execution = sqlx::query_as::<_, WorkflowExecution>(
        "INSERT INTO workflow_executions (workflow_id, execution_number, status, input_variables) \
         VALUES ( \
             $1, \
             COALESCE((SELECT MAX(execution_number) FROM workflow_executions WHERE workflow_id = $1), 0) + 1, \
             'pending', $2 \
         ) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(input_variables)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert workflow execution")?;

    sqlx::query(
        "INSERT INTO workflow_step_executions (execution_id, step_id, status) \
         SELECT $1, id, 'pending' FROM workflow_steps WHERE workflow_id = $2",
    )
    .bind(execution.id)
    .bind(workflow_id)
    .execute(&mut *tx)
    .await
    .context("failed to seed workflow step executions")?;

    tx.commit().await.context("failed to commit transaction")?;

    Ok(execution)
}

/// Fetch a workflow execution by ID.
pub async fn get_workflow_execution(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<WorkflowExecution>> {
    let execution =
        sqlx::query_as::<_, WorkflowExecution>("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch workflow execution")?;

    Ok(execution)
}

/// List every execution of a workflow, most recent first.
pub async fn list_executions_for_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<WorkflowExecution>> {
    let executions = sqlx::query_as::<_, WorkflowExecution>(
        "SELECT * FROM workflow_executions WHERE workflow_id = $1 ORDER BY execution_number DESC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow executions")?;

    Ok(executions)
}

/// Atomically transition an execution's status, optimistically locked on
/// the expected current status.
pub async fn transition_execution_status(
    pool: &PgPool,
    execution_id: Uuid,
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_executions \
         SET status = $1, \
             started_at = CASE WHEN $1 = 'running' THEN NOW() ELSE started_at END, \
             completed_at = CASE WHEN $1 IN ('completed','failed','cancelled') THEN NOW() ELSE completed_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(execution_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition workflow execution status")?;

    Ok(result.rows_affected())
}

/// Record a terminal failure on an execution.
pub async fn fail_execution(
    pool: &PgPool,
    execution_id: Uuid,
    error_kind: ErrorKind,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_executions \
         SET status = 'failed', error_kind = $1, error_message = $2, completed_at = NOW() \
         WHERE id = $3",
    )
    .bind(error_kind)
    .bind(error_message)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to fail workflow execution")?;

    Ok(())
}

/// Record a terminal failure on a step execution, matching `fail_execution`'s
/// shape one level down the DAG.
pub async fn fail_step_execution(
    pool: &PgPool,
    step_execution_id: Uuid,
    error_kind: ErrorKind,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_step_executions \
         SET status = 'failed', error_kind = $1, error_message = $2, completed_at = NOW() \
         WHERE id = $3",
    )
    .bind(error_kind)
    .bind(error_message)
    .bind(step_execution_id)
    .execute(pool)
    .await
    .context("failed to fail workflow step execution")?;

    Ok(())
}

/// Fetch a single step execution by ID.
pub async fn get_step_execution(
    pool: &PgPool,
    step_execution_id: Uuid,
) -> Result<Option<WorkflowStepExecution>> {
    let step_execution = sqlx::query_as::<_, WorkflowStepExecution>(
        "SELECT * FROM workflow_step_executions WHERE id = $1",
    )
    .bind(step_execution_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch workflow step execution")?;

    Ok(step_execution)
}

/// Cancel every step execution in a run that hasn't already reached a
/// terminal status. Used when an execution is cancelled outright, as
/// opposed to [`skip_downstream_steps`] which only cancels a single step's
/// descendants.
pub async fn cancel_pending_step_executions(pool: &PgPool, execution_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_step_executions \
         SET status = 'cancelled', completed_at = NOW() \
         WHERE execution_id = $1 \
           AND status NOT IN ('completed', 'failed', 'skipped', 'cancelled')",
    )
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to cancel pending workflow step executions")?;

    Ok(result.rows_affected())
}

/// Get every step execution in a run whose upstream dependencies have all
/// completed (or were skipped) and which is itself still pending -- the
/// scheduling frontier of the DAG.
pub async fn get_ready_step_executions(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<WorkflowStepExecution>> {
    let steps = sqlx::query_as::<_, WorkflowStepExecution>(
        "SELECT wse.* \
         FROM workflow_step_executions wse \
         WHERE wse.execution_id = $1 \
           AND wse.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM workflow_step_dependencies wsd \
               JOIN workflow_step_executions dep \
                 ON dep.step_id = wsd.depends_on AND dep.execution_id = wse.execution_id \
               WHERE wsd.step_id = wse.step_id \
                 AND dep.status NOT IN ('completed', 'skipped') \
           )",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to get ready step executions")?;

    Ok(steps)
}

/// Transition a step execution's status, optimistically locked.
pub async fn transition_step_execution_status(
    pool: &PgPool,
    step_execution_id: Uuid,
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_step_executions \
         SET status = $1, \
             started_at = CASE WHEN $1 = 'running' THEN NOW() ELSE started_at END, \
             completed_at = CASE WHEN $1 IN ('completed','failed','skipped','cancelled') THEN NOW() ELSE completed_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(step_execution_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition workflow step execution status")?;

    Ok(result.rows_affected())
}

/// Persist a step's output and bump its retry counter.
pub async fn set_step_execution_output(
    pool: &PgPool,
    step_execution_id: Uuid,
    output: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE workflow_step_executions SET output = $1 WHERE id = $2")
        .bind(output)
        .bind(step_execution_id)
        .execute(pool)
        .await
        .context("failed to set workflow step execution output")?;

    Ok(())
}

/// Increment a step's retry counter (one row per attempt is not kept; retries
/// reuse the same step-execution row, matching the teacher's task-attempt
/// convention).
pub async fn increment_step_retry(pool: &PgPool, step_execution_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE workflow_step_executions SET retry_count = retry_count + 1 \
         WHERE id = $1 \
         RETURNING retry_count",
    )
    .bind(step_execution_id)
    .fetch_one(pool)
    .await
    .context("failed to increment workflow step retry count")?;

    Ok(row.0)
}

/// Mark every step downstream of `step_id` (transitively) as `skipped`,
/// without touching sibling branches that don't depend on it.
pub async fn skip_downstream_steps(pool: &PgPool, execution_id: Uuid, step_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "WITH RECURSIVE downstream(id) AS ( \
             SELECT wsd.step_id FROM workflow_step_dependencies wsd WHERE wsd.depends_on = $2 \
             UNION \
             SELECT wsd.step_id FROM workflow_step_dependencies wsd \
             JOIN downstream d ON wsd.depends_on = d.id \
         ) \
         UPDATE workflow_step_executions \
         SET status = 'skipped', completed_at = NOW() \
         WHERE execution_id = $1 \
           AND step_id IN (SELECT id FROM downstream) \
           AND status = 'pending'",
    )
    .bind(execution_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to skip downstream steps")?;

    Ok(result.rows_affected())
}

/// Whether every step execution in a run has reached a terminal status.
pub async fn is_execution_complete(pool: &PgPool, execution_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM workflow_step_executions \
         WHERE execution_id = $1 AND status NOT IN ('completed','failed','skipped','cancelled')",
    )
    .bind(execution_id)
    .fetch_one(pool)
    .await
    .context("failed to check workflow execution completion")?;

    Ok(row.0 == 0)
}
