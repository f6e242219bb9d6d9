//! Approval Gate: human-in-the-loop approval records with a background
//! sweeper racing the human response under a per-approval optimistic lock.
//!
//! Generalizes the auto/human split already in
//! [`crate::gate::evaluator::evaluate_verdict`] (`GateAction::{Auto,
//! HumanReview, HumanApprove}`) from "decide how a task's gate should be
//! checked" to "represent and race the human-in-the-loop wait itself". The
//! race itself reuses the same optimistic-lock CAS pattern as
//! [`crate::state::RunPhaseStateMachine::transition`] and
//! `queries::tasks::transition_task_status`: an `UPDATE ... WHERE status =
//! 'pending'` that reports zero rows affected when the sweeper (or another
//! caller) already resolved the row first.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fabric_db::models::{ApprovalStatus, ErrorKind, StepApproval};
use fabric_db::queries::approvals::{self, NewApproval};

use crate::broadcaster::Broadcaster;
use crate::error::FabricError;
use crate::events::{Event, EventType};

/// Whether an approval step in a workflow resolves itself or requires a
/// human. Mirrors `GatePolicy::{Auto, HumanReview, HumanApprove}`'s split,
/// renamed to the Workflow Engine's approval-step vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Resolves on its own after `auto_approve_after_seconds` elapses with
    /// no human response.
    AutoApproveAfterTimeout,
    /// Never auto-resolves; a human response is required, or the approval
    /// times out as rejected.
    HumanRequired,
}

/// A human (or sweeper) decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
    RequestChanges,
    Cancelled,
}

impl Decision {
    fn to_status(self) -> ApprovalStatus {
        match self {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Rejected => ApprovalStatus::Rejected,
            Decision::RequestChanges => ApprovalStatus::RequestChanges,
            Decision::Cancelled => ApprovalStatus::Cancelled,
        }
    }
}

/// Parameters for requesting a new approval.
#[derive(Debug, Clone)]
pub struct RequestApproval {
    pub step_execution_id: Uuid,
    pub execution_id: Uuid,
    pub title: String,
    pub description: String,
    pub approval_data: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub auto_approve_after_seconds: Option<i32>,
    pub required_approvers: Vec<String>,
}

/// Errors surfaced by [`Gate::respond`].
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The approval was already resolved -- by a human response that raced
    /// this one, or by the background sweeper -- before this call's CAS
    /// landed. The loser of the race observes this.
    #[error("approval {0} was already resolved")]
    AlreadyResolved(Uuid),

    #[error("approval {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Approval record lifecycle, plus the background expiry/auto-approve
/// sweeper.
#[derive(Clone)]
pub struct Gate {
    pool: PgPool,
}

impl Gate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn request(&self, req: RequestApproval) -> Result<StepApproval, FabricError> {
        let new = NewApproval {
            step_execution_id: req.step_execution_id,
            execution_id: req.execution_id,
            title: req.title,
            description: req.description,
            approval_data: req.approval_data,
            expires_at: req.expires_at,
            auto_approve_after_seconds: req.auto_approve_after_seconds,
            required_approvers: req.required_approvers,
            parent_approval_id: None,
        };
        approvals::insert_approval(&self.pool, &new)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }

    pub async fn get(&self, id: Uuid) -> Result<StepApproval, FabricError> {
        approvals::get_approval(&self.pool, id)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?
            .ok_or_else(|| FabricError::not_found(format!("approval {id} not found")))
    }

    /// Race a human response against the sweeper: the CAS only succeeds if
    /// the approval is still `pending`. Zero rows affected means the
    /// sweeper (or a concurrent response) won the race first.
    pub async fn respond(
        &self,
        id: Uuid,
        decision: Decision,
        approver: &str,
        feedback: Option<&str>,
        response_data: Option<&serde_json::Value>,
    ) -> Result<StepApproval, ApprovalError> {
        let rows = approvals::respond_to_approval(
            &self.pool,
            id,
            decision.to_status(),
            approver,
            feedback,
            response_data,
        )
        .await?;

        if rows == 0 {
            return Err(ApprovalError::AlreadyResolved(id));
        }

        approvals::get_approval(&self.pool, id)
            .await?
            .ok_or(ApprovalError::NotFound(id))
    }

    /// `RequestChanges`: resolve the original approval as
    /// `request_changes`, then open a new approval chained to it via
    /// `parent_approval_id`. The new row's `revision_count` is computed by
    /// `insert_approval`'s own SQL from the parent, so it is always exactly
    /// one more than its parent's, even under concurrent revision chains.
    pub async fn request_changes(
        &self,
        original: &StepApproval,
        feedback: &str,
        approver: &str,
        new_title: String,
        new_description: String,
        new_approval_data: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<StepApproval, ApprovalError> {
        self.respond(
            original.id,
            Decision::RequestChanges,
            approver,
            Some(feedback),
            None,
        )
        .await?;

        let new = NewApproval {
            step_execution_id: original.step_execution_id,
            execution_id: original.execution_id,
            title: new_title,
            description: new_description,
            approval_data: new_approval_data,
            expires_at,
            auto_approve_after_seconds: original.auto_approve_after_seconds,
            required_approvers: original.required_approvers.clone(),
            parent_approval_id: Some(original.id),
        };

        Ok(approvals::insert_approval(&self.pool, &new).await?)
    }

    /// One sweep: expire overdue approvals, then auto-approve ones whose
    /// grace period elapsed. Order matters -- an approval cannot be both
    /// expired (hard deadline) and auto-approved (soft grace period) in the
    /// same sweep; expiry is checked first since it is the harder
    /// constraint of the two.
    async fn sweep_once(&self, broadcaster: Option<&Broadcaster>) -> Result<(), FabricError> {
        let expired = approvals::expire_overdue_approvals(&self.pool)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
        let auto_approved = approvals::auto_approve_elapsed(&self.pool)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        if let Some(broadcaster) = broadcaster {
            for approval in expired.iter().chain(auto_approved.iter()) {
                broadcaster
                    .publish(Event::new(
                        Uuid::nil(),
                        EventType::ApprovalResolved,
                        serde_json::json!({
                            "approval_id": approval.id,
                            "status": approval.status.to_string(),
                        }),
                    ))
                    .await;
            }
        }

        Ok(())
    }

    /// Run the sweeper loop until `cancel` fires. Grounded in the same
    /// "long-lived background task with a cancellation token" shape the
    /// workflow scheduler uses for its own loop.
    pub async fn run_sweeper(
        &self,
        interval: Duration,
        broadcaster: Option<Broadcaster>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(broadcaster.as_ref()).await {
                        tracing::warn!(error = %err, "approval sweep failed");
                    }
                }
            }
        }
    }

    pub async fn list_pending(&self) -> Result<Vec<StepApproval>, FabricError> {
        approvals::list_pending_approvals(&self.pool)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_maps_to_expected_status() {
        assert_eq!(Decision::Approved.to_status(), ApprovalStatus::Approved);
        assert_eq!(Decision::RequestChanges.to_status(), ApprovalStatus::RequestChanges);
    }
}
