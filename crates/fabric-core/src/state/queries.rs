//! Query helpers for task run progress tracking.
//!
//! Re-exports and wraps the lower-level DB queries from
//! [`fabric_db::queries::task_runs`] for use in the orchestration layer.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use fabric_db::models::TaskRun;
pub use fabric_db::queries::task_runs::TaskRunProgress;

/// List every run recorded for a task, newest first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskRun>> {
    fabric_db::queries::task_runs::list_runs_for_task(pool, task_id).await
}

/// Get a progress summary (counts by terminal/non-terminal bucket) for a
/// task's runs.
pub async fn get_task_run_progress(pool: &PgPool, task_id: Uuid) -> Result<TaskRunProgress> {
    fabric_db::queries::task_runs::get_task_run_progress(pool, task_id).await
}

/// Whether the most recent run of a task has reached a terminal phase.
pub async fn is_latest_run_terminal(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let runs = list_runs_for_task(pool, task_id).await?;
    Ok(runs.first().is_some_and(|r| r.phase.is_terminal()))
}
