use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Coarse lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Phase of a single [`TaskRun`]'s state machine. Covers both in-flight
/// phases and terminal states, so a run's `phase` column never needs a
/// second status column alongside it to tell whether the run is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Created,
    Analyzing,
    Planning,
    AwaitingApproval,
    Executing,
    Reviewing,
    Revising,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    PlanRejected,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout | Self::PlanRejected
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Reviewing => "reviewing",
            Self::Revising => "revising",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::PlanRejected => "plan_rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for RunPhase {
    type Err = RunPhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "analyzing" => Ok(Self::Analyzing),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "reviewing" => Ok(Self::Reviewing),
            "revising" => Ok(Self::Revising),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            "plan_rejected" => Ok(Self::PlanRejected),
            other => Err(RunPhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunPhase`] string.
#[derive(Debug, Clone)]
pub struct RunPhaseParseError(pub String);

impl fmt::Display for RunPhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run phase: {:?}", self.0)
    }
}

impl std::error::Error for RunPhaseParseError {}

// ---------------------------------------------------------------------------

/// Progress of a [`TaskRun`]'s Git lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GitStatus {
    Pending,
    BranchCreated,
    Committed,
    Pushed,
    PrOpened,
    Failed,
}

impl fmt::Display for GitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::BranchCreated => "branch_created",
            Self::Committed => "committed",
            Self::Pushed => "pushed",
            Self::PrOpened => "pr_opened",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for GitStatus {
    type Err = GitStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "branch_created" => Ok(Self::BranchCreated),
            "committed" => Ok(Self::Committed),
            "pushed" => Ok(Self::Pushed),
            "pr_opened" => Ok(Self::PrOpened),
            "failed" => Ok(Self::Failed),
            other => Err(GitStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GitStatus`] string.
#[derive(Debug, Clone)]
pub struct GitStatusParseError(pub String);

impl fmt::Display for GitStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid git status: {:?}", self.0)
    }
}

impl std::error::Error for GitStatusParseError {}

// ---------------------------------------------------------------------------

/// The error taxonomy carried on every terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    DeadlineExceeded,
    Cancelled,
    LlmFailed,
    SandboxFailed,
    GitFailed,
    BudgetExhausted,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::LlmFailed => "llm_failed",
            Self::SandboxFailed => "sandbox_failed",
            Self::GitFailed => "git_failed",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_input" => Ok(Self::InvalidInput),
            "not_found" => Ok(Self::NotFound),
            "conflict" => Ok(Self::Conflict),
            "deadline_exceeded" => Ok(Self::DeadlineExceeded),
            "cancelled" => Ok(Self::Cancelled),
            "llm_failed" => Ok(Self::LlmFailed),
            "sandbox_failed" => Ok(Self::SandboxFailed),
            "git_failed" => Ok(Self::GitFailed),
            "budget_exhausted" => Ok(Self::BudgetExhausted),
            "internal" => Ok(Self::Internal),
            other => Err(ErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone)]
pub struct ErrorKindParseError(pub String);

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error kind: {:?}", self.0)
    }
}

impl std::error::Error for ErrorKindParseError {}

// ---------------------------------------------------------------------------

/// Kind of a [`WorkflowStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Condition,
    Parallel,
    Sequential,
    Agent,
    Approval,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Agent => "agent",
            Self::Approval => "approval",
        };
        f.write_str(s)
    }
}

impl FromStr for StepType {
    type Err = StepTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "condition" => Ok(Self::Condition),
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "agent" => Ok(Self::Agent),
            "approval" => Ok(Self::Approval),
            other => Err(StepTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepType`] string.
#[derive(Debug, Clone)]
pub struct StepTypeParseError(pub String);

impl fmt::Display for StepTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step type: {:?}", self.0)
    }
}

impl std::error::Error for StepTypeParseError {}

/// What happens to downstream steps when a step exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Abort,
    Continue,
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
        })
    }
}

/// Status of a [`WorkflowExecution`] or [`WorkflowStepExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

/// Status of a [`StepApproval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    RequestChanges,
    Cancelled,
    Timeout,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RequestChanges => "request_changes",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalStatus {
    type Err = ApprovalStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "request_changes" => Ok(Self::RequestChanges),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(ApprovalStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ApprovalStatus`] string.
#[derive(Debug, Clone)]
pub struct ApprovalStatusParseError(pub String);

impl fmt::Display for ApprovalStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid approval status: {:?}", self.0)
    }
}

impl std::error::Error for ApprovalStatusParseError {}

/// Status of a [`SandboxExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Killed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl FromStr for SandboxStatus {
    type Err = SandboxStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "killed" => Ok(Self::Killed),
            other => Err(SandboxStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SandboxStatus`] string.
#[derive(Debug, Clone)]
pub struct SandboxStatusParseError(pub String);

impl fmt::Display for SandboxStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sandbox status: {:?}", self.0)
    }
}

impl std::error::Error for SandboxStatusParseError {}

// ---------------------------------------------------------------------------
// Tenancy roots
// ---------------------------------------------------------------------------

/// A tenant boundary. Every other aggregate hangs off one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A project within a workspace -- owns a git remote and commit conventions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub repo_url: Option<String>,
    pub branch_prefix: String,
    pub commit_template: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task Executor
// ---------------------------------------------------------------------------

/// A task -- the unit of work a caller submits to the fabric.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    pub config: serde_json::Value,
    pub status: TaskStatus,
    pub max_rounds: i32,
    pub max_revision_rounds: i32,
    pub branch_prefix: Option<String>,
    pub commit_template: Option<String>,
    pub successful_runs: i32,
    pub failed_runs: i32,
    pub in_progress_runs: i32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn total_runs(&self) -> i32 {
        self.successful_runs + self.failed_runs + self.in_progress_runs
    }
}

/// One attempt at executing a [`Task`] through the phase state machine.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub run_number: i32,
    pub phase: RunPhase,
    pub plan: Option<serde_json::Value>,
    pub results: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub round_count: i32,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub git_status: GitStatus,
}

// ---------------------------------------------------------------------------
// Workflow Engine
// ---------------------------------------------------------------------------

/// A DAG of steps, defined once and executed many times.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A single node in a [`Workflow`]'s DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub step_type: StepType,
    pub step_order: i32,
    pub config: serde_json::Value,
    pub retry_policy: serde_json::Value,
    pub on_failure: OnFailure,
}

/// An edge in a workflow's dependency DAG: `step_id` depends on `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowStepDependency {
    pub step_id: Uuid,
    pub depends_on: Uuid,
}

/// One run of a [`Workflow`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub execution_number: i32,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input_variables: serde_json::Value,
    pub results: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// The execution record for a single step within a [`WorkflowExecution`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowStepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub retry_count: i32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// A human-in-the-loop gate on a [`WorkflowStepExecution`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepApproval {
    pub id: Uuid,
    pub step_execution_id: Uuid,
    pub execution_id: Uuid,
    pub status: ApprovalStatus,
    pub title: String,
    pub description: String,
    pub approval_data: serde_json::Value,
    pub approver: Option<String>,
    pub feedback: Option<String>,
    pub response_data: Option<serde_json::Value>,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub auto_approve_after_seconds: Option<i32>,
    pub required_approvers: Vec<String>,
    pub revision_count: i32,
    pub parent_approval_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Multi-Agent Controller & Memory
// ---------------------------------------------------------------------------

/// A registered agent role/capability template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentDefinition {
    pub id: Uuid,
    pub role: String,
    pub name: String,
    pub capabilities: Vec<String>,
}

/// A live, assignable instance of an [`AgentDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub name: String,
    pub capabilities: Vec<String>,
    pub active_load: i32,
    pub healthy: bool,
}

/// A versioned context shared across an agent's runs on a project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentContext {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub current_version: i32,
}

/// A single immutable snapshot of an [`AgentContext`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentContextVersion {
    pub id: Uuid,
    pub context_id: Uuid,
    pub version: i32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A key-value fact recorded in an agent instance's working memory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentMemoryEntry {
    pub id: Uuid,
    pub agent_instance_id: Uuid,
    pub key: String,
    pub value: serde_json::Value,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub received_from: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Sandbox Runner
// ---------------------------------------------------------------------------

/// One isolated execution of a command inside a sandboxed container.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SandboxExecution {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub language: String,
    pub command: String,
    pub status: SandboxStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub peak_memory_mb: Option<i32>,
    pub cpu_percent: Option<f32>,
    pub container_id: Option<String>,
    pub timeout_seconds: i32,
    pub memory_limit_mb: i32,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Event Broadcaster
// ---------------------------------------------------------------------------

/// The persisted form of an [`crate::models`]-adjacent event envelope
/// (see `fabric_core::events::Event` for the in-memory/wire form).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRow {
    pub event_id: Uuid,
    pub event_type: String,
    pub recorded_at: DateTime<Utc>,
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn run_phase_display_roundtrip_and_terminal() {
        let variants = [
            RunPhase::Created,
            RunPhase::Analyzing,
            RunPhase::Planning,
            RunPhase::AwaitingApproval,
            RunPhase::Executing,
            RunPhase::Reviewing,
            RunPhase::Revising,
            RunPhase::Completing,
            RunPhase::Completed,
            RunPhase::Failed,
            RunPhase::Cancelled,
            RunPhase::Timeout,
            RunPhase::PlanRejected,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunPhase = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!(RunPhase::Completed.is_terminal());
        assert!(RunPhase::PlanRejected.is_terminal());
        assert!(!RunPhase::Executing.is_terminal());
        assert!(!RunPhase::Revising.is_terminal());
    }

    #[test]
    fn run_phase_invalid() {
        assert!("bogus".parse::<RunPhase>().is_err());
    }

    #[test]
    fn git_status_display_roundtrip() {
        let variants = [
            GitStatus::Pending,
            GitStatus::BranchCreated,
            GitStatus::Committed,
            GitStatus::Pushed,
            GitStatus::PrOpened,
            GitStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: GitStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn error_kind_display_roundtrip() {
        let variants = [
            ErrorKind::InvalidInput,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Cancelled,
            ErrorKind::LlmFailed,
            ErrorKind::SandboxFailed,
            ErrorKind::GitFailed,
            ErrorKind::BudgetExhausted,
            ErrorKind::Internal,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ErrorKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn step_type_display_roundtrip() {
        let variants = [
            StepType::Task,
            StepType::Condition,
            StepType::Parallel,
            StepType::Sequential,
            StepType::Agent,
            StepType::Approval,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StepType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_terminal_classification() {
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Ready.is_terminal());
    }

    #[test]
    fn approval_status_display_roundtrip() {
        let variants = [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::RequestChanges,
            ApprovalStatus::Cancelled,
            ApprovalStatus::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ApprovalStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn sandbox_status_display_roundtrip() {
        let variants = [
            SandboxStatus::Pending,
            SandboxStatus::Running,
            SandboxStatus::Completed,
            SandboxStatus::Failed,
            SandboxStatus::Timeout,
            SandboxStatus::Killed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SandboxStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_total_runs_invariant() {
        let task = Task {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "t".into(),
            description: "d".into(),
            config: serde_json::json!({}),
            status: TaskStatus::Running,
            max_rounds: 3,
            max_revision_rounds: 2,
            branch_prefix: None,
            commit_template: None,
            successful_runs: 2,
            failed_runs: 1,
            in_progress_runs: 1,
            created_at: Utc::now(),
        };
        assert_eq!(task.total_runs(), 4);
    }
}
