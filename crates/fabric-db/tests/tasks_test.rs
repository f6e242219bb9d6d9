//! Integration tests for workspace/project/task/task-run CRUD and the run
//! phase state machine.

use fabric_db::models::{ErrorKind, RunPhase, TaskStatus};
use fabric_db::queries::{task_runs, tasks, workspaces};
use fabric_test_utils::{create_test_db, drop_test_db};

async fn seed_project(pool: &sqlx::PgPool) -> (uuid::Uuid, uuid::Uuid) {
    let workspace = workspaces::insert_workspace(pool, "acme").await.unwrap();
    let project = workspaces::insert_project(
        pool,
        workspace.id,
        "widgets",
        Some("https://example.com/widgets.git"),
        "fabric/",
        "[fabric] {task_name}",
    )
    .await
    .unwrap();
    (workspace.id, project.id)
}

#[tokio::test]
async fn insert_and_get_task() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id) = seed_project(&pool).await;

    let task = tasks::insert_task(
        &pool,
        workspace_id,
        project_id,
        "add-retry-logic",
        "Add retry logic to the HTTP client",
        &serde_json::json!({"priority": "high"}),
        3,
        2,
        None,
        None,
    )
    .await
    .expect("insert_task should succeed");

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.max_rounds, 3);
    assert_eq!(task.total_runs(), 0);

    let fetched = tasks::get_task(&pool, task.id)
        .await
        .unwrap()
        .expect("task should exist");
    assert_eq!(fetched.name, "add-retry-logic");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_tasks_for_project_scopes_correctly() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id) = seed_project(&pool).await;
    let other_project = workspaces::insert_project(
        &pool,
        workspace_id,
        "gadgets",
        None,
        "fabric/",
        "[fabric] {task_name}",
    )
    .await
    .unwrap();

    tasks::insert_task(
        &pool,
        workspace_id,
        project_id,
        "a",
        "d",
        &serde_json::json!({}),
        1,
        1,
        None,
        None,
    )
    .await
    .unwrap();
    tasks::insert_task(
        &pool,
        workspace_id,
        other_project.id,
        "b",
        "d",
        &serde_json::json!({}),
        1,
        1,
        None,
        None,
    )
    .await
    .unwrap();

    let widget_tasks = tasks::list_tasks_for_project(&pool, project_id).await.unwrap();
    assert_eq!(widget_tasks.len(), 1);
    assert_eq!(widget_tasks[0].name, "a");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_phase_transitions_follow_optimistic_locking() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id) = seed_project(&pool).await;
    let task = tasks::insert_task(
        &pool,
        workspace_id,
        project_id,
        "t",
        "d",
        &serde_json::json!({}),
        1,
        2,
        None,
        None,
    )
    .await
    .unwrap();

    let run = task_runs::insert_task_run(&pool, task.id, workspace_id, project_id)
        .await
        .unwrap();
    assert_eq!(run.phase, RunPhase::Created);
    assert_eq!(run.run_number, 1);

    let affected = task_runs::transition_run_phase(
        &pool,
        run.id,
        RunPhase::Created,
        RunPhase::Analyzing,
        Some(chrono::Utc::now()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(affected, 1);

    // A stale `from` should not match -- the run already moved past `created`.
    let stale = task_runs::transition_run_phase(
        &pool,
        run.id,
        RunPhase::Created,
        RunPhase::Planning,
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(stale, 0, "optimistic lock should reject a stale `from` phase");

    let fetched = task_runs::get_task_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(fetched.phase, RunPhase::Analyzing);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_numbers_increment_per_task() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id) = seed_project(&pool).await;
    let task = tasks::insert_task(
        &pool,
        workspace_id,
        project_id,
        "t",
        "d",
        &serde_json::json!({}),
        1,
        1,
        None,
        None,
    )
    .await
    .unwrap();

    let first = task_runs::insert_task_run(&pool, task.id, workspace_id, project_id)
        .await
        .unwrap();
    let second = task_runs::insert_task_run(&pool, task.id, workspace_id, project_id)
        .await
        .unwrap();

    assert_eq!(first.run_number, 1);
    assert_eq!(second.run_number, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fail_run_records_error_kind_and_message() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id) = seed_project(&pool).await;
    let task = tasks::insert_task(
        &pool,
        workspace_id,
        project_id,
        "t",
        "d",
        &serde_json::json!({}),
        1,
        1,
        None,
        None,
    )
    .await
    .unwrap();
    let run = task_runs::insert_task_run(&pool, task.id, workspace_id, project_id)
        .await
        .unwrap();

    let affected = task_runs::fail_run(
        &pool,
        run.id,
        RunPhase::Failed,
        ErrorKind::SandboxFailed,
        "container exited with code 137",
    )
    .await
    .unwrap();
    assert_eq!(affected, 1);

    let fetched = task_runs::get_task_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(fetched.phase, RunPhase::Failed);
    assert_eq!(fetched.error_kind, Some(ErrorKind::SandboxFailed));
    assert!(fetched.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reset_orphaned_runs_only_touches_non_terminal_phases() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id) = seed_project(&pool).await;
    let task = tasks::insert_task(
        &pool,
        workspace_id,
        project_id,
        "t",
        "d",
        &serde_json::json!({}),
        1,
        1,
        None,
        None,
    )
    .await
    .unwrap();

    let in_flight = task_runs::insert_task_run(&pool, task.id, workspace_id, project_id)
        .await
        .unwrap();
    task_runs::transition_run_phase(
        &pool,
        in_flight.id,
        RunPhase::Created,
        RunPhase::Executing,
        None,
        None,
    )
    .await
    .unwrap();

    let done = task_runs::insert_task_run(&pool, task.id, workspace_id, project_id)
        .await
        .unwrap();
    task_runs::fail_run(&pool, done.id, RunPhase::Completed, ErrorKind::Internal, "")
        .await
        .ok();

    let reset = task_runs::reset_orphaned_runs(&pool, workspace_id).await.unwrap();
    assert_eq!(reset.len(), 1);
    assert_eq!(reset[0].id, in_flight.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}
