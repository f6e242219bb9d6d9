//! Integration coverage for the cross-module invariants that the testable
//! invariant list holds a task run, an agent memory store, and a context
//! version history to, each backed by a real Postgres instance the way
//! `state_machine_test.rs` is.

use fabric_core::memory::{MemoryLimits, MemoryStore};
use fabric_db::queries::{task_runs, tasks, workspaces};
use fabric_test_utils::{create_test_db, drop_test_db};

async fn seed_task(pool: &sqlx::PgPool) -> (uuid::Uuid, uuid::Uuid, uuid::Uuid) {
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
    let task = tasks::insert_task(
        pool,
        workspace.id,
        project.id,
        "add a health check endpoint",
        "",
        &serde_json::json!({}),
        3,
        3,
        None,
        None,
    )
    .await
    .unwrap();
    (workspace.id, project.id, task.id)
}

#[tokio::test]
async fn at_most_one_active_run_per_task_enforced_by_db() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id, task_id) = seed_task(&pool).await;

    let first = task_runs::insert_task_run(&pool, task_id, workspace_id, project_id)
        .await
        .expect("first run for a task with no active run must succeed");
    assert_eq!(first.run_number, 1);

    assert!(
        task_runs::get_active_run_for_task(&pool, task_id)
            .await
            .unwrap()
            .is_some(),
        "freshly inserted run must be visible as the active run"
    );

    let second = task_runs::insert_task_run(&pool, task_id, workspace_id, project_id).await;
    assert!(
        second.is_err(),
        "a second non-terminal run for the same task must be rejected by the partial unique index"
    );

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn a_completed_run_frees_the_task_for_a_new_active_run() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id, task_id) = seed_task(&pool).await;

    let first = task_runs::insert_task_run(&pool, task_id, workspace_id, project_id)
        .await
        .unwrap();

    task_runs::fail_run(
        &pool,
        first.id,
        fabric_db::models::RunPhase::Cancelled,
        fabric_db::models::ErrorKind::Cancelled,
        "cancelled for test",
    )
    .await
    .unwrap();

    assert!(
        task_runs::get_active_run_for_task(&pool, task_id)
            .await
            .unwrap()
            .is_none(),
        "a terminal run must no longer count as active"
    );

    let second = task_runs::insert_task_run(&pool, task_id, workspace_id, project_id)
        .await
        .expect("a new run must be insertable once the prior run reached a terminal phase");
    assert_eq!(second.run_number, 2);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_count_invariant_matches_task_status_transitions() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id, task_id) = seed_task(&pool).await;

    let run = task_runs::insert_task_run(&pool, task_id, workspace_id, project_id)
        .await
        .unwrap();
    tasks::mark_run_started(&pool, task_id).await.unwrap();

    let mid = tasks::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(mid.in_progress_runs, 1);
    assert_eq!(mid.successful_runs, 0);
    assert_eq!(mid.failed_runs, 0);

    task_runs::fail_run(
        &pool,
        run.id,
        fabric_db::models::RunPhase::Failed,
        fabric_db::models::ErrorKind::Internal,
        "boom",
    )
    .await
    .unwrap();
    tasks::mark_run_finished(&pool, task_id, false).await.unwrap();

    let after = tasks::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(after.in_progress_runs, 0, "a finished run must no longer be counted as in progress");
    assert_eq!(after.failed_runs, 1);
    assert_eq!(after.successful_runs, 0);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn context_versions_are_monotonic_and_immutable() {
    let (pool, db_name) = create_test_db().await;
    let (workspace_id, project_id, _task_id) = seed_task(&pool).await;

    let store = MemoryStore::new(pool.clone(), MemoryLimits::default());
    let context = store
        .create_context(workspace_id, project_id, "planning-notes")
        .await
        .unwrap();

    let v1 = store
        .commit_version(context.id, &serde_json::json!({"step": 1}))
        .await
        .unwrap();
    let v2 = store
        .commit_version(context.id, &serde_json::json!({"step": 2}))
        .await
        .unwrap();
    let v3 = store
        .commit_version(context.id, &serde_json::json!({"step": 3}))
        .await
        .unwrap();

    assert!(v1.version < v2.version && v2.version < v3.version, "versions must increase monotonically");

    let latest = store.read_version(context.id, None).await.unwrap();
    assert_eq!(latest.version, v3.version, "reading with no version must return the most recent one");

    let rolled_back = store.read_version(context.id, Some(v1.version)).await.unwrap();
    assert_eq!(rolled_back.data, serde_json::json!({"step": 1}), "an older version's data must remain unchanged");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn memory_ttl_expiry_and_lru_eviction_enforce_limits() {
    let (pool, db_name) = create_test_db().await;

    let definition = sqlx::query_as::<_, fabric_db::models::AgentDefinition>(
        "INSERT INTO agent_definitions (role, name, capabilities) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind("engineer")
    .bind("engineer-primary")
    .bind(vec!["rust".to_string()])
    .fetch_one(&pool)
    .await
    .unwrap();

    let instance = sqlx::query_as::<_, fabric_db::models::AgentInstance>(
        "INSERT INTO agent_instances (definition_id, name, capabilities) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(definition.id)
    .bind("engineer-primary-1")
    .bind(vec!["rust".to_string()])
    .fetch_one(&pool)
    .await
    .unwrap();

    // A tiny byte ceiling forces eviction after the second write.
    let store = MemoryStore::new(
        pool.clone(),
        MemoryLimits {
            ttl_seconds: 24 * 3600,
            max_bytes: 40,
        },
    );

    store
        .remember(instance.id, "first", &serde_json::json!("aaaaaaaaaaaaaaaaaaaa"), None)
        .await
        .unwrap();
    store
        .remember(instance.id, "second", &serde_json::json!("bbbbbbbbbbbbbbbbbbbb"), None)
        .await
        .unwrap();

    let first = store.recall(instance.id, "first").await.unwrap();
    let second = store.recall(instance.id, "second").await.unwrap();
    assert!(first.is_none(), "the least-recently-used entry must be evicted once the byte ceiling is exceeded");
    assert!(second.is_some(), "the most recently written entry must survive eviction");

    drop_test_db(&db_name).await;
}
