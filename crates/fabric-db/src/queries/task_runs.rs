//! Database query functions for the `task_runs` table: the phase state
//! machine driving the Task Executor.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ErrorKind, GitStatus, RunPhase, TaskRun};

/// Insert a new task run at phase `created`, with `run_number` set to one
/// past the task's current highest run number.
pub async fn insert_task_run(
    pool: &PgPool,
    task_id: Uuid,
    workspace_id: Uuid,
    project_id: Uuid,
) -> Result<TaskRun> {
    let run = sqlx::query_as::<_, TaskRun>(
        "INSERT INTO task_runs (task_id, workspace_id, project_id, run_number, phase, git_status) \
         VALUES ( \
             $1, $2, $3, \
             COALESCE((SELECT MAX(run_number) FROM task_runs WHERE task_id = $1), 0) + 1, \
             'created', 'pending' \
         ) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(workspace_id)
    .bind(project_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task run")?;

    Ok(run)
}

/// Fetch the task's run currently in a non-terminal phase, if any. Used to
/// enforce "at most one run per task in flight" ahead of
/// [`insert_task_run`]; the partial unique index on `task_runs(task_id)` in
/// the schema enforces the same invariant at the database level as a
/// backstop against a racing second caller.
pub async fn get_active_run_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskRun>> {
    let run = sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_runs \
         WHERE task_id = $1 \
           AND phase NOT IN ('completed', 'failed', 'cancelled', 'timeout', 'plan_rejected') \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active task run")?;

    Ok(run)
}

/// Fetch a single task run by ID.
pub async fn get_task_run(pool: &PgPool, id: Uuid) -> Result<Option<TaskRun>> {
    let run = sqlx::query_as::<_, TaskRun>("SELECT * FROM task_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task run")?;

    Ok(run)
}

/// List all runs for a task, newest first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_runs WHERE task_id = $1 ORDER BY run_number DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task runs")?;

    Ok(runs)
}

/// Atomically transition a run from one phase to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `phase = $from`, so the row only updates if the current phase matches.
/// Returns the number of rows affected (0 means a concurrent writer won the
/// race or the run had already moved on).
pub async fn transition_run_phase(
    pool: &PgPool,
    run_id: Uuid,
    from: RunPhase,
    to: RunPhase,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET phase = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND phase = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task run phase")?;

    Ok(result.rows_affected())
}

/// Record a terminal failure on a run, regardless of its current phase
/// (cancellation and timeout can interrupt any in-flight phase).
pub async fn fail_run(
    pool: &PgPool,
    run_id: Uuid,
    phase: RunPhase,
    error_kind: ErrorKind,
    error_message: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET phase = $1, error_kind = $2, error_message = $3, completed_at = NOW() \
         WHERE id = $4 AND completed_at IS NULL",
    )
    .bind(phase)
    .bind(error_kind)
    .bind(error_message)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to fail task run")?;

    Ok(result.rows_affected())
}

/// Persist the plan produced by the analysis/planning phases.
pub async fn set_run_plan(pool: &PgPool, run_id: Uuid, plan: &serde_json::Value) -> Result<()> {
    sqlx::query("UPDATE task_runs SET plan = $1 WHERE id = $2")
        .bind(plan)
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to set task run plan")?;

    Ok(())
}

/// Persist final results and increment the revision round counter.
pub async fn set_run_results(
    pool: &PgPool,
    run_id: Uuid,
    results: &serde_json::Value,
    round_count: i32,
) -> Result<()> {
    sqlx::query("UPDATE task_runs SET results = $1, round_count = $2 WHERE id = $3")
        .bind(results)
        .bind(round_count)
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to set task run results")?;

    Ok(())
}

/// Advance the run's git status (branch created / committed / pushed / PR opened).
pub async fn update_run_git_status(
    pool: &PgPool,
    run_id: Uuid,
    git_status: GitStatus,
    branch_name: Option<&str>,
    commit_sha: Option<&str>,
    pr_url: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_runs \
         SET git_status = $1, \
             branch_name = COALESCE($2, branch_name), \
             commit_sha = COALESCE($3, commit_sha), \
             pr_url = COALESCE($4, pr_url) \
         WHERE id = $5",
    )
    .bind(git_status)
    .bind(branch_name)
    .bind(commit_sha)
    .bind(pr_url)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to update task run git status")?;

    Ok(())
}

/// Reset runs stuck in a non-terminal phase back to `failed` with
/// `Cancelled` as the recorded cause. Used for restart recovery: if the
/// executor process crashes mid-run, in-flight runs are left in limbo and
/// need to be reconciled before new work is scheduled.
pub async fn reset_orphaned_runs(pool: &PgPool, workspace_id: Uuid) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "UPDATE task_runs \
         SET phase = 'failed', error_kind = 'cancelled', \
             error_message = 'run orphaned by executor restart', \
             completed_at = NOW() \
         WHERE workspace_id = $1 \
           AND phase NOT IN ('completed', 'failed', 'cancelled', 'timeout', 'plan_rejected') \
         RETURNING *",
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned task runs")?;

    Ok(runs)
}

/// Status counts for a task's runs.
#[derive(Debug, Clone, Default)]
pub struct TaskRunProgress {
    pub in_flight: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Summarize a task's runs by terminal/non-terminal bucket.
pub async fn get_task_run_progress(pool: &PgPool, task_id: Uuid) -> Result<TaskRunProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT phase::text, COUNT(*) as cnt \
         FROM task_runs \
         WHERE task_id = $1 \
         GROUP BY phase",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get task run progress")?;

    let mut progress = TaskRunProgress::default();
    for (phase, count) in &rows {
        match phase.as_str() {
            "completed" => progress.completed += count,
            "failed" | "plan_rejected" => progress.failed += count,
            "cancelled" => progress.cancelled += count,
            "timeout" => progress.failed += count,
            _ => progress.in_flight += count,
        }
        progress.total += count;
    }
    Ok(progress)
}
