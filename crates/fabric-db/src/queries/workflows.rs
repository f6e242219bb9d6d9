//! Database query functions for `workflows`, `workflow_steps`, and
//! `workflow_step_dependencies` (the static DAG definition, not a run of it).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{OnFailure, StepType, Workflow, WorkflowStep, WorkflowStepDependency};

/// Insert a new workflow row.
pub async fn insert_workflow(
    pool: &PgPool,
    workspace_id: Uuid,
    project_id: Uuid,
    name: &str,
) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (workspace_id, project_id, name) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(workspace_id)
    .bind(project_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow")?;

    Ok(workflow)
}

/// Fetch a workflow by ID.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List all workflows in a project.
pub async fn list_workflows_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE project_id = $1 ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflows for project")?;

    Ok(workflows)
}

/// Insert a new step into a workflow's DAG.
#[allow(clippy::too_many_arguments)]
pub async fn insert_workflow_step(
    pool: &PgPool,
    workflow_id: Uuid,
    name: &str,
    step_type: StepType,
    step_order: i32,
    config: &serde_json::Value,
    retry_policy: &serde_json::Value,
    on_failure: OnFailure,
) -> Result<WorkflowStep> {
    let step = sqlx::query_as::<_, WorkflowStep>(
        "INSERT INTO workflow_steps \
         (workflow_id, name, step_type, step_order, config, retry_policy, on_failure) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(name)
    .bind(step_type)
    .bind(step_order)
    .bind(config)
    .bind(retry_policy)
    .bind(on_failure)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow step")?;

    Ok(step)
}

/// List all steps belonging to a workflow, in declaration order.
pub async fn list_steps_for_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<WorkflowStep>> {
    let steps = sqlx::query_as::<_, WorkflowStep>(
        "SELECT * FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_order ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow steps")?;

    Ok(steps)
}

/// Insert a dependency edge: `step_id` depends on `depends_on`. Idempotent.
pub async fn insert_step_dependency(pool: &PgPool, step_id: Uuid, depends_on: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_step_dependencies (step_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(step_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert workflow step dependency")?;

    Ok(())
}

/// List every dependency edge for a workflow (used to build the in-memory
/// DAG for validation and topological scheduling).
pub async fn list_dependencies_for_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<WorkflowStepDependency>> {
    let edges = sqlx::query_as::<_, WorkflowStepDependency>(
        "SELECT wsd.step_id, wsd.depends_on \
         FROM workflow_step_dependencies wsd \
         JOIN workflow_steps ws ON ws.id = wsd.step_id \
         WHERE ws.workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow step dependencies")?;

    Ok(edges)
}
