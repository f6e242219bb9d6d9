//! Mandatory persistence subscriber.
//!
//! Every published event must reach the durable `events` table; a
//! persistence failure must not silently drop the event, so writes are
//! retried with backoff before the event is handed to a dead-letter sink.
//! Grounded in `fabric_db::queries::events::insert_event`'s `ON CONFLICT
//! (event_id) DO UPDATE` idempotency, which gives crash-safe redelivery
//! without double-writing.

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use fabric_db::queries::events::{insert_event, NewEventRow};

use crate::events::Event;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// A channel events that exhausted their retries are pushed to, so the
/// process doesn't lose them outright even though they never reached
/// storage.
pub type DeadLetterSink = mpsc::Sender<Event>;

/// Drain `rx`, writing each event to Postgres with bounded retry. Runs
/// until the channel closes (i.e. the broadcaster side drops its sender,
/// which happens on `unsubscribe` or shutdown).
pub async fn run(pool: PgPool, mut rx: mpsc::Receiver<Event>, dead_letter: DeadLetterSink) {
    while let Some(event) = rx.recv().await {
        if let Err(event) = persist_with_retry(&pool, event).await {
            tracing::error!(event_id = %event.event_id, "persistence subscriber exhausted retries, dead-lettering event");
            let _ = dead_letter.send(event).await;
        }
    }
}

/// Attempt to persist a single event, retrying with exponential backoff.
/// Returns the event back on failure so the caller can dead-letter it.
async fn persist_with_retry(pool: &PgPool, event: Event) -> Result<(), Event> {
    let new_row = NewEventRow {
        event_id: event.event_id,
        event_type: format!("{:?}", event.event_type),
        version: event.version.clone(),
        workspace_id: event.workspace_id,
        task_id: event.task_id,
        run_id: event.run_id,
        workflow_id: event.workflow_id,
        execution_id: event.execution_id,
        agent_id: event.agent_id,
        correlation_id: event.correlation_id.clone(),
        data: event.data.clone(),
    };

    let mut attempt = 0;
    loop {
        match insert_event(pool, &new_row).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    tracing::warn!(event_id = %event.event_id, error = %err, attempt, "event persistence failed, giving up");
                    return Err(event);
                }
                tracing::warn!(event_id = %event.event_id, error = %err, attempt, "event persistence failed, retrying");
                sleep(RETRY_BASE_DELAY * attempt).await;
            }
        }
    }
}
