//! Integration coverage for the Workflow Engine's DAG scheduling: a diamond
//! dependency (fan-out into two branches, fan-in to a join step) must run
//! the branches only after their shared ancestor completes and the join
//! only after both branches complete, backed by a real Postgres instance
//! the way `invariants_test.rs` is.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use fabric_core::workflow::{DriveOutcome, StepExecutor, StepOutcome, WorkflowEngine};
use fabric_db::models::{WorkflowExecution, WorkflowStep, WorkflowStepExecution};
use fabric_db::queries::workspaces;
use fabric_test_utils::{create_test_db, drop_test_db};

/// Records the order steps were dispatched in, without ever failing, so a
/// run should always drive to completion.
struct RecordingExecutor {
    order: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            order: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn run_step(
        &self,
        step: &WorkflowStep,
        _step_execution: &WorkflowStepExecution,
        _execution: &WorkflowExecution,
        _cancel: CancellationToken,
    ) -> Result<StepOutcome, fabric_core::error::FabricError> {
        self.order.lock().await.push(step.name.clone());
        Ok(StepOutcome::Completed {
            output: serde_json::json!({}),
        })
    }
}

const DIAMOND_WORKFLOW: &str = r#"
[workflow]
name = "diamond"

[[steps]]
name = "start"
step_type = "task"

[[steps]]
name = "left"
step_type = "task"
depends_on = ["start"]

[[steps]]
name = "right"
step_type = "task"
depends_on = ["start"]

[[steps]]
name = "join"
step_type = "task"
depends_on = ["left", "right"]
"#;

#[tokio::test]
async fn diamond_dag_runs_join_only_after_both_branches_complete() {
    let (pool, db_name) = create_test_db().await;
    let workspace = workspaces::insert_workspace(&pool, "acme").await.unwrap();
    let project = workspaces::insert_project(
        &pool,
        workspace.id,
        "widgets",
        None,
        "fabric/",
        "[fabric] {task_name}",
    )
    .await
    .unwrap();

    let engine = WorkflowEngine::new(pool.clone(), 4);
    let workflow = engine
        .define_workflow(workspace.id, project.id, DIAMOND_WORKFLOW)
        .await
        .expect("diamond workflow should define cleanly");

    let executor = Arc::new(RecordingExecutor::new());
    let (_execution, outcome) = engine
        .start_execution(
            workflow.id,
            serde_json::json!({}),
            executor.clone(),
            None,
            CancellationToken::new(),
        )
        .await
        .expect("run should complete without a FabricError");

    assert_eq!(outcome, DriveOutcome::Completed);

    let order = executor.order.lock().await.clone();
    assert_eq!(order.len(), 4, "every step must run exactly once: {order:?}");

    let start_pos = order.iter().position(|s| s == "start").unwrap();
    let left_pos = order.iter().position(|s| s == "left").unwrap();
    let right_pos = order.iter().position(|s| s == "right").unwrap();
    let join_pos = order.iter().position(|s| s == "join").unwrap();

    assert!(start_pos < left_pos && start_pos < right_pos, "both branches must run after the shared ancestor: {order:?}");
    assert!(left_pos < join_pos && right_pos < join_pos, "the join step must run after both branches: {order:?}");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn a_rejected_workflow_definition_with_a_cycle_is_never_persisted() {
    let (pool, db_name) = create_test_db().await;
    let workspace = workspaces::insert_workspace(&pool, "acme").await.unwrap();
    let project = workspaces::insert_project(
        &pool,
        workspace.id,
        "widgets",
        None,
        "fabric/",
        "[fabric] {task_name}",
    )
    .await
    .unwrap();

    let cyclic = r#"
[workflow]
name = "cyclic"

[[steps]]
name = "a"
step_type = "task"
depends_on = ["b"]

[[steps]]
name = "b"
step_type = "task"
depends_on = ["a"]
"#;

    let engine = WorkflowEngine::new(pool.clone(), 4);
    let result = engine.define_workflow(workspace.id, project.id, cyclic).await;
    assert!(result.is_err(), "a cyclic workflow must be rejected before anything is written");

    let workflows = fabric_db::queries::workflows::list_workflows_for_project(&pool, project.id)
        .await
        .unwrap();
    assert!(workflows.is_empty(), "a rejected definition must leave no workflow row behind");

    drop_test_db(&db_name).await;
}
