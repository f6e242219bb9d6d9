//! The wire-level event envelope published through the Event Broadcaster.
//!
//! Distinct from [`fabric_db::models::EventRow`]: the row is what the
//! persistence subscriber writes to the `events` table; [`Event`] is what
//! every publisher constructs and every subscriber receives, before it has
//! (or, for transient events, ever gets) a home in storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kinds emitted at state transitions across every core component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskRunPhaseChanged,
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    StepExecutionStarted,
    StepExecutionCompleted,
    ApprovalRequested,
    ApprovalResolved,
    SandboxOutputChunk,
    SandboxExecutionFinished,
    AgentAssigned,
    AgentReleased,
    /// Synthetic event delivered to a subscriber whose overflow queue
    /// dropped messages under sustained backpressure.
    SubscriberLagging,
}

/// A single published event, matching spec.md §6's language-independent
/// envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp_utc: DateTime<Utc>,
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

impl Event {
    pub fn new(workspace_id: Uuid, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp_utc: Utc::now(),
            version: "1".to_string(),
            workspace_id,
            task_id: None,
            run_id: None,
            workflow_id: None,
            execution_id: None,
            agent_id: None,
            correlation_id: None,
            data,
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The hierarchical topics this event matches, most specific first.
    /// Subscribers glob-match against these: `all`, `workspace:{id}`, and
    /// one `workspace:{id}.<entity>:{id}` segment per populated scope field.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = vec!["all".to_string(), format!("workspace:{}", self.workspace_id)];
        if let Some(task_id) = self.task_id {
            topics.push(format!("workspace:{}.task:{}", self.workspace_id, task_id));
        }
        if let Some(workflow_id) = self.workflow_id {
            topics.push(format!(
                "workspace:{}.workflow:{}",
                self.workspace_id, workflow_id
            ));
        }
        if let Some(agent_id) = self.agent_id {
            topics.push(format!("workspace:{}.agent:{}", self.workspace_id, agent_id));
        }
        topics
    }
}
