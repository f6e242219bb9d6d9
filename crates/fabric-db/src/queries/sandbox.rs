//! Database query functions for the `sandbox_executions` table (Sandbox
//! Runner).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{SandboxExecution, SandboxStatus};

/// Parameters for starting a new sandbox execution.
#[derive(Debug, Clone)]
pub struct NewSandboxExecution {
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub language: String,
    pub command: String,
    pub timeout_seconds: i32,
    pub memory_limit_mb: i32,
}

/// Insert a new sandbox execution row at `pending`.
pub async fn insert_sandbox_execution(
    pool: &PgPool,
    new: &NewSandboxExecution,
) -> Result<SandboxExecution> {
    let execution = sqlx::query_as::<_, SandboxExecution>(
        "INSERT INTO sandbox_executions \
         (workspace_id, project_id, language, command, status, timeout_seconds, memory_limit_mb) \
         VALUES ($1, $2, $3, $4, 'pending', $5, $6) \
         RETURNING *",
    )
    .bind(new.workspace_id)
    .bind(new.project_id)
    .bind(&new.language)
    .bind(&new.command)
    .bind(new.timeout_seconds)
    .bind(new.memory_limit_mb)
    .fetch_one(pool)
    .await
    .context("failed to insert sandbox execution")?;

    Ok(execution)
}

/// Mark an execution as started and record the backing container ID.
pub async fn mark_sandbox_started(pool: &PgPool, id: Uuid, container_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sandbox_executions \
         SET status = 'running', container_id = $1, started_at = NOW() \
         WHERE id = $2",
    )
    .bind(container_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark sandbox execution started")?;

    Ok(())
}

/// Record the final result of a sandbox execution.
#[allow(clippy::too_many_arguments)]
pub async fn finish_sandbox_execution(
    pool: &PgPool,
    id: Uuid,
    status: SandboxStatus,
    stdout: &str,
    stderr: &str,
    exit_code: Option<i32>,
    duration_ms: i64,
    peak_memory_mb: Option<i32>,
    cpu_percent: Option<f32>,
    error_type: Option<&str>,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sandbox_executions \
         SET status = $1, stdout = $2, stderr = $3, exit_code = $4, completed_at = NOW(), \
             duration_ms = $5, peak_memory_mb = $6, cpu_percent = $7, \
             error_type = $8, error_message = $9 \
         WHERE id = $10",
    )
    .bind(status)
    .bind(stdout)
    .bind(stderr)
    .bind(exit_code)
    .bind(duration_ms)
    .bind(peak_memory_mb)
    .bind(cpu_percent)
    .bind(error_type)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish sandbox execution")?;

    Ok(())
}

/// Fetch a sandbox execution by ID.
pub async fn get_sandbox_execution(pool: &PgPool, id: Uuid) -> Result<Option<SandboxExecution>> {
    let execution =
        sqlx::query_as::<_, SandboxExecution>("SELECT * FROM sandbox_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch sandbox execution")?;

    Ok(execution)
}

/// List sandbox executions still running past their timeout -- candidates
/// for the reaper to kill.
pub async fn list_overdue_sandbox_executions(pool: &PgPool) -> Result<Vec<SandboxExecution>> {
    let executions = sqlx::query_as::<_, SandboxExecution>(
        "SELECT * FROM sandbox_executions \
         WHERE status = 'running' \
           AND started_at + (timeout_seconds || ' seconds')::interval <= NOW()",
    )
    .fetch_all(pool)
    .await
    .context("failed to list overdue sandbox executions")?;

    Ok(executions)
}
