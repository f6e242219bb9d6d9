//! Task run phase state machine.
//!
//! Validates and executes phase transitions for [`fabric_db::models::TaskRun`],
//! enforcing the allowed transition graph, optimistic locking, and timestamp
//! management. Terminal failures (cancellation, timeout, sandbox/git/LLM
//! errors) bypass the transition graph entirely and go through
//! [`fabric_db::queries::task_runs::fail_run`], which can interrupt any
//! in-flight phase.

pub mod dispatch;
pub mod queries;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use fabric_db::models::RunPhase;
use fabric_db::queries::task_runs as db;

/// The task run phase state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// created           -> analyzing
/// analyzing         -> planning
/// planning          -> awaiting_approval
/// awaiting_approval -> executing       (plan approved)
/// awaiting_approval -> plan_rejected   (plan rejected, terminal)
/// executing         -> reviewing
/// reviewing         -> completing      (review: approved)
/// reviewing         -> revising        (review: changes required)
/// revising          -> executing       (loop back for another round)
/// completing        -> completed
/// ```
pub struct RunPhaseStateMachine;

impl RunPhaseStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in the
    /// state graph.
    pub fn is_valid_transition(from: RunPhase, to: RunPhase) -> bool {
        matches!(
            (from, to),
            (RunPhase::Created, RunPhase::Analyzing)
                | (RunPhase::Analyzing, RunPhase::Planning)
                | (RunPhase::Planning, RunPhase::AwaitingApproval)
                | (RunPhase::AwaitingApproval, RunPhase::Executing)
                | (RunPhase::AwaitingApproval, RunPhase::PlanRejected)
                | (RunPhase::Executing, RunPhase::Reviewing)
                | (RunPhase::Reviewing, RunPhase::Completing)
                | (RunPhase::Reviewing, RunPhase::Revising)
                | (RunPhase::Revising, RunPhase::Executing)
                | (RunPhase::Completing, RunPhase::Completed)
        )
    }

    /// Execute a phase transition with optimistic locking.
    ///
    /// Sets `started_at` on the `created -> analyzing` edge (the run's first
    /// transition) and `completed_at` when a transition lands on a terminal
    /// phase.
    ///
    /// Returns an error if the transition is not a valid edge, or if the
    /// current phase in the database does not match `from` (optimistic lock
    /// failure).
    pub async fn transition(pool: &PgPool, run_id: Uuid, from: RunPhase, to: RunPhase) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid run phase transition: {} -> {} for run {}", from, to, run_id);
        }

        let started_at = if from == RunPhase::Created {
            Some(Utc::now())
        } else {
            None
        };
        let completed_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let rows = db::transition_run_phase(pool, run_id, from, to, started_at, completed_at)
            .await
            .with_context(|| format!("failed to transition run {} from {} to {}", run_id, from, to))?;

        if rows == 0 {
            let run = db::get_task_run(pool, run_id).await?;
            match run {
                None => bail!("task run {} not found", run_id),
                Some(r) => bail!(
                    "optimistic lock failed: run {} has phase {}, expected {}",
                    run_id,
                    r.phase,
                    from
                ),
            }
        }

        Ok(())
    }
}
