//! Database query functions for the `step_approvals` table (Approval Gate).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ApprovalStatus, StepApproval};

/// Parameters for requesting a new approval.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub step_execution_id: Uuid,
    pub execution_id: Uuid,
    pub title: String,
    pub description: String,
    pub approval_data: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub auto_approve_after_seconds: Option<i32>,
    pub required_approvers: Vec<String>,
    pub parent_approval_id: Option<Uuid>,
}

/// Insert a new pending approval.
pub async fn insert_approval(pool: &PgPool, new: &NewApproval) -> Result<StepApproval> {
    let approval = sqlx::query_as::<_, StepApproval>(
        "INSERT INTO step_approvals \
         (step_execution_id, execution_id, status, title, description, approval_data, \
          expires_at, auto_approve_after_seconds, required_approvers, revision_count, \
          parent_approval_id) \
         VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, \
                 COALESCE((SELECT revision_count + 1 FROM step_approvals WHERE id = $9), 0), $9) \
         RETURNING *",
    )
    .bind(new.step_execution_id)
    .bind(new.execution_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.approval_data)
    .bind(new.expires_at)
    .bind(new.auto_approve_after_seconds)
    .bind(&new.required_approvers)
    .bind(new.parent_approval_id)
    .fetch_one(pool)
    .await
    .context("failed to insert approval")?;

    Ok(approval)
}

/// Fetch an approval by ID.
pub async fn get_approval(pool: &PgPool, id: Uuid) -> Result<Option<StepApproval>> {
    let approval = sqlx::query_as::<_, StepApproval>("SELECT * FROM step_approvals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch approval")?;

    Ok(approval)
}

/// List every approval still awaiting a response, ordered by request time.
pub async fn list_pending_approvals(pool: &PgPool) -> Result<Vec<StepApproval>> {
    let approvals = sqlx::query_as::<_, StepApproval>(
        "SELECT * FROM step_approvals WHERE status = 'pending' ORDER BY requested_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending approvals")?;

    Ok(approvals)
}

/// Record a human response, optimistically locked on `status = 'pending'`.
/// Returns the number of rows affected (0 means the approval already
/// resolved, e.g. raced by the expiry sweeper).
pub async fn respond_to_approval(
    pool: &PgPool,
    id: Uuid,
    status: ApprovalStatus,
    approver: &str,
    feedback: Option<&str>,
    response_data: Option<&serde_json::Value>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE step_approvals \
         SET status = $1, approver = $2, feedback = $3, response_data = $4, responded_at = NOW() \
         WHERE id = $5 AND status = 'pending'",
    )
    .bind(status)
    .bind(approver)
    .bind(feedback)
    .bind(response_data)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to respond to approval")?;

    Ok(result.rows_affected())
}

/// Expire every pending approval whose deadline has passed. Run periodically
/// by the approval sweeper.
pub async fn expire_overdue_approvals(pool: &PgPool) -> Result<Vec<StepApproval>> {
    let expired = sqlx::query_as::<_, StepApproval>(
        "UPDATE step_approvals \
         SET status = 'timeout', responded_at = NOW() \
         WHERE status = 'pending' AND expires_at <= NOW() \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to expire overdue approvals")?;

    Ok(expired)
}

/// Auto-approve every pending approval whose `auto_approve_after_seconds`
/// grace period has elapsed since it was requested.
pub async fn auto_approve_elapsed(pool: &PgPool) -> Result<Vec<StepApproval>> {
    let approved = sqlx::query_as::<_, StepApproval>(
        "UPDATE step_approvals \
         SET status = 'approved', approver = 'system:auto-approve', responded_at = NOW() \
         WHERE status = 'pending' \
           AND auto_approve_after_seconds IS NOT NULL \
           AND requested_at + (auto_approve_after_seconds || ' seconds')::interval <= NOW() \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to auto-approve elapsed approvals")?;

    Ok(approved)
}
