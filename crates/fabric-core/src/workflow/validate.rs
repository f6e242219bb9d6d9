//! Workflow DAG validation: parse a [`WorkflowToml`], then check names,
//! step types, dependency references, and acyclicity before any of it is
//! persisted.
//!
//! The cycle check is [`crate::plan::parser::check_for_cycles`]'s Kahn's
//! algorithm verbatim, reindexed over step names instead of task names.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use thiserror::Error;

use fabric_db::models::StepType;

use super::toml_format::WorkflowToml;

#[derive(Debug, Error)]
pub enum WorkflowValidationError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("workflow must contain at least one step")]
    NoSteps,

    #[error("duplicate step name: {0:?}")]
    DuplicateStepName(String),

    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency { step: String, dependency: String },

    #[error("invalid step_type {value:?} on step {step:?}")]
    InvalidStepType { step: String, value: String },

    #[error("dependency cycle detected involving steps: {0}")]
    CycleDetected(String),
}

/// Parse and validate a workflow definition string.
pub fn parse_workflow_toml(content: &str) -> Result<WorkflowToml, WorkflowValidationError> {
    let workflow: WorkflowToml = toml::from_str(content)?;
    validate(&workflow)?;
    Ok(workflow)
}

fn validate(workflow: &WorkflowToml) -> Result<(), WorkflowValidationError> {
    if workflow.steps.is_empty() {
        return Err(WorkflowValidationError::NoSteps);
    }

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(&step.name) {
            return Err(WorkflowValidationError::DuplicateStepName(step.name.clone()));
        }
    }

    for step in &workflow.steps {
        if StepType::from_str(&step.step_type).is_err() {
            return Err(WorkflowValidationError::InvalidStepType {
                step: step.name.clone(),
                value: step.step_type.clone(),
            });
        }

        for dep in &step.depends_on {
            if !seen.contains(dep) {
                return Err(WorkflowValidationError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(workflow)?;

    Ok(())
}

/// Kahn's algorithm topological sort; a node left with nonzero in-degree
/// once the queue drains means it sits on (or downstream of) a cycle.
fn check_for_cycles(workflow: &WorkflowToml) -> Result<(), WorkflowValidationError> {
    let names: Vec<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();
    let name_to_idx: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect();

    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for step in &workflow.steps {
        let step_idx = name_to_idx[step.name.as_str()];
        for dep_name in &step.depends_on {
            let dep_idx = name_to_idx[dep_name.as_str()];
            adj[dep_idx].push(step_idx);
            in_degree[step_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_steps: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| names[i])
            .collect();
        return Err(WorkflowValidationError::CycleDetected(cycle_steps.join(", ")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_diamond_dag() {
        let toml_str = r#"
[workflow]
name = "Diamond"

[[steps]]
name = "a"
step_type = "task"

[[steps]]
name = "b"
step_type = "task"
depends_on = ["a"]

[[steps]]
name = "c"
step_type = "task"
depends_on = ["a"]

[[steps]]
name = "d"
step_type = "task"
depends_on = ["b", "c"]
"#;
        let wf = parse_workflow_toml(toml_str).expect("diamond should validate");
        assert_eq!(wf.steps.len(), 4);
    }

    #[test]
    fn rejects_direct_cycle() {
        let toml_str = r#"
[workflow]
name = "Cycle"

[[steps]]
name = "a"
step_type = "task"
depends_on = ["b"]

[[steps]]
name = "b"
step_type = "task"
depends_on = ["a"]
"#;
        let err = parse_workflow_toml(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::CycleDetected(_)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let toml_str = r#"
[workflow]
name = "Bad dep"

[[steps]]
name = "a"
step_type = "task"
depends_on = ["nonexistent"]
"#;
        let err = parse_workflow_toml(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let toml_str = r#"
[workflow]
name = "Dup"

[[steps]]
name = "a"
step_type = "task"

[[steps]]
name = "a"
step_type = "task"
"#;
        let err = parse_workflow_toml(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::DuplicateStepName(ref n) if n == "a"));
    }

    #[test]
    fn rejects_invalid_step_type() {
        let toml_str = r#"
[workflow]
name = "Bad type"

[[steps]]
name = "a"
step_type = "teleport"
"#;
        let err = parse_workflow_toml(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::InvalidStepType { .. }));
    }

    #[test]
    fn rejects_empty_steps() {
        let toml_str = r#"
[workflow]
name = "Empty"
"#;
        let err = parse_workflow_toml(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::NoSteps));
    }
}
