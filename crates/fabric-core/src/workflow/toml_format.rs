//! TOML format for workflow definition files.
//!
//! Generalizes [`crate::plan::toml_format`]'s `PlanToml`/`TaskToml` shape
//! from "one task list with a scope/gate per task" to "a DAG of typed
//! steps" -- the `[[tasks]]` array becomes `[[steps]]`, `depends_on` keeps
//! its by-name-reference meaning unchanged.

use serde::{Deserialize, Serialize};

/// Top-level structure of a workflow definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowToml {
    pub workflow: WorkflowMeta,
    #[serde(default)]
    pub steps: Vec<StepToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMeta {
    pub name: String,
}

/// A single `[[steps]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepToml {
    /// Unique step name within the workflow, referenced by `depends_on`.
    pub name: String,
    /// One of "task", "condition", "parallel", "sequential", "agent",
    /// "approval" -- validated against [`fabric_db::models::StepType`].
    pub step_type: String,
    /// Names of steps that must complete (or be skipped) before this one
    /// becomes ready.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Opaque, step-type-specific configuration (command line, agent
    /// capabilities, approval title/description, condition expression...).
    #[serde(default = "default_config")]
    pub config: toml::Value,
    #[serde(default)]
    pub retry: RetryToml,
    /// "abort" (default) or "continue" -- what happens to this step's
    /// downstream steps if it exhausts its retries.
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryToml {
    #[serde(default = "default_retry_max")]
    pub max_attempts: i32,
}

impl Default for RetryToml {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max(),
        }
    }
}

fn default_retry_max() -> i32 {
    0
}

fn default_on_failure() -> String {
    "abort".to_string()
}

fn default_config() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}
