//! Convenience dispatch helpers that wrap [`super::RunPhaseStateMachine`]
//! transitions with semantic names matching the executor's pipeline steps.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use fabric_db::models::RunPhase;

use super::RunPhaseStateMachine;

/// Begin analysis: transition `created -> analyzing`. Sets `started_at`.
pub async fn begin_analysis(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Created, RunPhase::Analyzing).await
}

/// Begin planning: transition `analyzing -> planning`.
pub async fn begin_planning(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Analyzing, RunPhase::Planning).await
}

/// Submit the plan for approval: transition `planning -> awaiting_approval`.
pub async fn await_approval(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Planning, RunPhase::AwaitingApproval).await
}

/// The plan was approved: transition `awaiting_approval -> executing`.
pub async fn approve_plan(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::AwaitingApproval, RunPhase::Executing).await
}

/// The plan was rejected: transition `awaiting_approval -> plan_rejected`
/// (terminal).
pub async fn reject_plan(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::AwaitingApproval, RunPhase::PlanRejected).await
}

/// Execution finished and is ready for review: transition
/// `executing -> reviewing`.
pub async fn begin_review(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Executing, RunPhase::Reviewing).await
}

/// Review approved the work: transition `reviewing -> completing`.
pub async fn approve_review(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Reviewing, RunPhase::Completing).await
}

/// Review requested changes: transition `reviewing -> revising`.
pub async fn request_revision(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Reviewing, RunPhase::Revising).await
}

/// Start another execution round after revision feedback: transition
/// `revising -> executing`.
pub async fn resume_execution(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Revising, RunPhase::Executing).await
}

/// Finalize a completed run: transition `completing -> completed`. Sets
/// `completed_at`.
pub async fn finalize(pool: &PgPool, run_id: Uuid) -> Result<()> {
    RunPhaseStateMachine::transition(pool, run_id, RunPhase::Completing, RunPhase::Completed).await
}
