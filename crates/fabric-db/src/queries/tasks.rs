//! Database query functions for the `tasks` table (Task Executor).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, run counters).
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    workspace_id: Uuid,
    project_id: Uuid,
    name: &str,
    description: &str,
    config: &serde_json::Value,
    max_rounds: i32,
    max_revision_rounds: i32,
    branch_prefix: Option<&str>,
    commit_template: Option<&str>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
         (workspace_id, project_id, name, description, config, max_rounds, \
          max_revision_rounds, branch_prefix, commit_template) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(workspace_id)
    .bind(project_id)
    .bind(name)
    .bind(description)
    .bind(config)
    .bind(max_rounds)
    .bind(max_revision_rounds)
    .bind(branch_prefix)
    .bind(commit_template)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project, ordered by creation time.
pub async fn list_tasks_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = $1 ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Update the coarse status of a task.
pub async fn update_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Increment the `in_progress_runs` counter when a new run starts.
pub async fn mark_run_started(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET in_progress_runs = in_progress_runs + 1, status = 'running' \
         WHERE id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark run started")?;

    Ok(())
}

/// Move a task's in-flight run counter into the terminal bucket that matches
/// `succeeded`, and set the coarse task status accordingly.
pub async fn mark_run_finished(pool: &PgPool, task_id: Uuid, succeeded: bool) -> Result<()> {
    let (counter, status): (&str, TaskStatus) = if succeeded {
        ("successful_runs", TaskStatus::Completed)
    } else {
        ("failed_runs", TaskStatus::Failed)
    };
    let stmt = format!(
        "UPDATE tasks \
         SET in_progress_runs = GREATEST(in_progress_runs - 1, 0), \
             {counter} = {counter} + 1, \
             status = $1 \
         WHERE id = $2"
    );
    sqlx::query(&stmt)
        .bind(status)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to mark run finished")?;

    Ok(())
}
