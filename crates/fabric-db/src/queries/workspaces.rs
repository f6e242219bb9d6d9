//! Database query functions for the `workspaces` and `projects` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Project, Workspace};

/// Insert a new workspace row. Returns the inserted row with server-generated
/// defaults (id, created_at).
pub async fn insert_workspace(pool: &PgPool, name: &str) -> Result<Workspace> {
    let workspace =
        sqlx::query_as::<_, Workspace>("INSERT INTO workspaces (name) VALUES ($1) RETURNING *")
            .bind(name)
            .fetch_one(pool)
            .await
            .context("failed to insert workspace")?;

    Ok(workspace)
}

/// Fetch a workspace by its ID.
pub async fn get_workspace(pool: &PgPool, id: Uuid) -> Result<Option<Workspace>> {
    let workspace = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workspace")?;

    Ok(workspace)
}

/// List all workspaces, ordered by creation time.
pub async fn list_workspaces(pool: &PgPool) -> Result<Vec<Workspace>> {
    let workspaces =
        sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list workspaces")?;

    Ok(workspaces)
}

/// Insert a new project row within a workspace.
pub async fn insert_project(
    pool: &PgPool,
    workspace_id: Uuid,
    name: &str,
    repo_url: Option<&str>,
    branch_prefix: &str,
    commit_template: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (workspace_id, name, repo_url, branch_prefix, commit_template) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(workspace_id)
    .bind(name)
    .bind(repo_url)
    .bind(branch_prefix)
    .bind(commit_template)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a project by its ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects in a workspace, ordered by creation time.
pub async fn list_projects_for_workspace(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE workspace_id = $1 ORDER BY created_at ASC",
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects for workspace")?;

    Ok(projects)
}
