//! Database query functions for the `events` table: the durable log behind
//! the Event Broadcaster's persistence subscriber.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::EventRow;

/// Parameters for recording a new event.
#[derive(Debug, Clone)]
pub struct NewEventRow {
    pub event_id: Uuid,
    pub event_type: String,
    pub version: String,
    pub workspace_id: Uuid,
    pub task_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub data: serde_json::Value,
}

/// Append an event to the durable log. Idempotent on `event_id` so a
/// subscriber that redelivers after a crash does not double-write.
pub async fn insert_event(pool: &PgPool, new: &NewEventRow) -> Result<EventRow> {
    let row = sqlx::query_as::<_, EventRow>(
        "INSERT INTO events \
         (event_id, event_type, version, workspace_id, task_id, run_id, workflow_id, \
          execution_id, agent_id, correlation_id, data) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (event_id) DO UPDATE SET event_id = events.event_id \
         RETURNING *",
    )
    .bind(new.event_id)
    .bind(&new.event_type)
    .bind(&new.version)
    .bind(new.workspace_id)
    .bind(new.task_id)
    .bind(new.run_id)
    .bind(new.workflow_id)
    .bind(new.execution_id)
    .bind(new.agent_id)
    .bind(&new.correlation_id)
    .bind(&new.data)
    .fetch_one(pool)
    .await
    .context("failed to insert event")?;

    Ok(row)
}

/// List events for a task run, ordered by recording time -- the history
/// backing a task run's audit trail.
pub async fn list_events_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<EventRow>> {
    let events = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM events WHERE run_id = $1 ORDER BY recorded_at ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list events for run")?;

    Ok(events)
}

/// List events recorded after a given event, within a workspace, for
/// reconnecting subscribers to replay what they missed.
pub async fn list_events_since(
    pool: &PgPool,
    workspace_id: Uuid,
    after: chrono::DateTime<chrono::Utc>,
    limit: i64,
) -> Result<Vec<EventRow>> {
    let events = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM events \
         WHERE workspace_id = $1 AND recorded_at > $2 \
         ORDER BY recorded_at ASC \
         LIMIT $3",
    )
    .bind(workspace_id)
    .bind(after)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list events since timestamp")?;

    Ok(events)
}
