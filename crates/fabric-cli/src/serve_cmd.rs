use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use fabric_db::models::{StepApproval, Task, TaskRun, Workflow, WorkflowExecution};
use fabric_db::queries::{approvals, task_runs, tasks as task_db, workflow_executions, workflows as workflow_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub runs: Vec<TaskRun>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowDetailResponse {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub executions: Vec<WorkflowExecution>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(pool: PgPool) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task_detail))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow_detail))
        .route("/api/approvals/pending", get(list_pending_approvals))
        .layer(CorsLayer::permissive())
        .with_state(pool)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, bind: &str, port: u16) -> Result<()> {
    let app = build_router(pool);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("fabric serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("fabric serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A project-scoped read-only surface would need a project ID in the path;
/// for now the index just links the JSON endpoints rather than listing
/// every task in every project with no scoping.
async fn index() -> axum::response::Response {
    let html = "<!DOCTYPE html>\
<html><head><title>fabric</title></head><body>\
<h1>fabric</h1>\
<p><a href=\"/api/approvals/pending\">/api/approvals/pending</a></p>\
</body></html>";
    Html(html).into_response()
}

async fn list_tasks(
    State(pool): State<PgPool>,
    axum::extract::Query(params): axum::extract::Query<std::collections::HashMap<String, String>>,
) -> Result<axum::response::Response, AppError> {
    let project_id: Uuid = params
        .get("project_id")
        .ok_or_else(|| AppError::not_found("project_id query parameter is required"))?
        .parse()
        .map_err(|_| AppError::not_found("project_id is not a valid UUID"))?;

    let tasks = task_db::list_tasks_for_project(&pool, project_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(tasks).into_response())
}

async fn get_task_detail(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let runs = task_runs::list_runs_for_task(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(TaskDetailResponse { task, runs }).into_response())
}

async fn list_workflows(
    State(pool): State<PgPool>,
    axum::extract::Query(params): axum::extract::Query<std::collections::HashMap<String, String>>,
) -> Result<axum::response::Response, AppError> {
    let project_id: Uuid = params
        .get("project_id")
        .ok_or_else(|| AppError::not_found("project_id query parameter is required"))?
        .parse()
        .map_err(|_| AppError::not_found("project_id is not a valid UUID"))?;

    let workflows = workflow_db::list_workflows_for_project(&pool, project_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(workflows).into_response())
}

async fn get_workflow_detail(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let workflow = workflow_db::get_workflow(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    let executions = workflow_executions::list_executions_for_workflow(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(WorkflowDetailResponse { workflow, executions }).into_response())
}

async fn list_pending_approvals(
    State(pool): State<PgPool>,
) -> Result<axum::response::Response, AppError> {
    let pending: Vec<StepApproval> = approvals::list_pending_approvals(&pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(pending).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use fabric_db::queries::{task_runs, tasks, workspaces};
    use fabric_test_utils::{create_test_db, drop_test_db};

    async fn send_request(pool: PgPool, uri: &str) -> axum::response::Response {
        let app = super::build_router(pool);
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_task(pool: &PgPool) -> fabric_db::models::Task {
        let workspace = workspaces::insert_workspace(pool, "acme").await.unwrap();
        let project = workspaces::insert_project(
            pool, workspace.id, "widgets", None, "fabric/", "[fabric] {task_name}",
        )
        .await
        .unwrap();
        tasks::insert_task(
            pool, workspace.id, project.id, "ship the thing", "", &serde_json::json!({}), 3, 3, None, None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_index_returns_html() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/html"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_tasks_requires_project_id() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "/api/tasks").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_tasks_with_data() {
        let (pool, db_name) = create_test_db().await;
        let task = seed_task(&pool).await;

        let resp = send_request(pool.clone(), &format!("/api/tasks?project_id={}", task.project_id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let arr = json.as_array().expect("response should be an array");
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["name"], task.name);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_get_task_detail_includes_runs() {
        let (pool, db_name) = create_test_db().await;
        let task = seed_task(&pool).await;
        task_runs::insert_task_run(&pool, task.id, task.workspace_id, task.project_id)
            .await
            .unwrap();

        let resp = send_request(pool.clone(), &format!("/api/tasks/{}", task.id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["name"], task.name);
        let runs = json["runs"].as_array().expect("should have runs array");
        assert_eq!(runs.len(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_get_task_not_found() {
        let (pool, db_name) = create_test_db().await;

        let random_id = uuid::Uuid::new_v4();
        let resp = send_request(pool.clone(), &format!("/api/tasks/{random_id}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_pending_approvals_empty() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "/api/approvals/pending").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
