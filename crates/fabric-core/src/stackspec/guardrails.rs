//! Guardrails applied before any manifest file reaches disk: path
//! validation, stack-structure validation, and keyword constraint checks.
//! Same validate-before-act discipline as the plan/token layers -- reject
//! with a structured reason rather than writing first and hoping.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::error::FabricError;
use crate::stackspec::manifest::ManifestFile;
use crate::stackspec::StackSpec;

/// Reject absolute paths, `..` segments, and anything else that would
/// resolve outside `project_root`.
pub fn validate_path(project_root: &Path, relative: &str) -> Result<PathBuf, FabricError> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(FabricError::invalid_input(format!(
            "path must be relative: {relative}"
        )));
    }
    if relative.trim().is_empty() {
        return Err(FabricError::invalid_input("path must not be empty"));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(FabricError::invalid_input(format!(
                    "path escapes project root: {relative}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FabricError::invalid_input(format!(
                    "invalid path component in: {relative}"
                )));
            }
        }
    }
    Ok(project_root.join(candidate))
}

/// Which of a stack's expected files are missing, and which present files
/// carry an extension the stack doesn't expect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructureReport {
    pub missing_expected_files: Vec<String>,
    pub unexpected_extensions: Vec<String>,
}

impl StructureReport {
    pub fn is_clean(&self) -> bool {
        self.missing_expected_files.is_empty() && self.unexpected_extensions.is_empty()
    }
}

pub fn validate_stack_structure(spec: &StackSpec, files: &[ManifestFile]) -> StructureReport {
    let present: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
    let missing_expected_files = spec
        .expected_files
        .iter()
        .filter(|expected| !present.contains(expected.as_str()))
        .cloned()
        .collect();

    let allowed_extensions = expected_extensions(spec);
    let unexpected_extensions = files
        .iter()
        .filter_map(|f| {
            let ext = Path::new(&f.path).extension()?.to_str()?.to_string();
            (!allowed_extensions.is_empty() && !allowed_extensions.contains(&ext)).then_some(f.path.clone())
        })
        .collect();

    StructureReport {
        missing_expected_files,
        unexpected_extensions,
    }
}

fn expected_extensions(spec: &StackSpec) -> HashSet<String> {
    spec.expected_files
        .iter()
        .filter_map(|f| Path::new(f).extension().and_then(|e| e.to_str()).map(str::to_string))
        .collect()
}

/// A single keyword constraint parsed from a stack spec's `constraints`
/// list. Kept as plain data, not a trait hierarchy -- there are only two
/// shapes and neither needs dynamic dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    MustContain { file: String, keyword: String },
    MustNotContain { keyword: String },
}

/// Parse the handful of constraint phrasings a stack spec uses. Anything
/// unrecognized is dropped rather than rejected -- constraints are an
/// advisory supplement to `forbidden_libraries`, not the sole gate.
pub fn parse_constraints(raw: &[String]) -> Vec<Constraint> {
    raw.iter()
        .filter_map(|line| {
            let lower = line.to_lowercase();
            if let Some(tool) = lower.strip_prefix("use ") {
                Some(Constraint::MustContain {
                    file: "package.json".to_string(),
                    keyword: tool.trim().to_string(),
                })
            } else if let Some(rest) = lower.strip_prefix("no ") {
                Some(Constraint::MustNotContain {
                    keyword: rest.trim().to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

pub fn validate_constraints(constraints: &[Constraint], files: &[ManifestFile]) -> Vec<String> {
    let mut violations = Vec::new();
    for constraint in constraints {
        match constraint {
            Constraint::MustContain { file, keyword } => {
                let found = files
                    .iter()
                    .any(|f| f.path == *file && f.content.to_lowercase().contains(keyword.as_str()));
                if !found {
                    violations.push(format!("{file} does not mention required keyword \"{keyword}\""));
                }
            }
            Constraint::MustNotContain { keyword } => {
                for f in files {
                    if f.content.to_lowercase().contains(keyword.as_str()) {
                        violations.push(format!(
                            "{} contains forbidden keyword \"{keyword}\"",
                            f.path
                        ));
                    }
                }
            }
        }
    }
    violations
}

pub fn forbidden_library_violations(spec: &StackSpec, files: &[ManifestFile]) -> Vec<String> {
    let mut violations = Vec::new();
    for forbidden in &spec.forbidden_libraries {
        for f in files {
            if f.content.to_lowercase().contains(&forbidden.to_lowercase()) {
                violations.push(format!(
                    "{} references forbidden library \"{forbidden}\"",
                    f.path
                ));
            }
        }
    }
    violations
}
