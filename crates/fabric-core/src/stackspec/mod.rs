//! Stack Specs & File Manifest: data describing the expected shape of a
//! generated project (test framework, package manager, expected files,
//! forbidden libraries), parsing of an agent's `FILE:`-delimited output
//! into a manifest, guardrails applied before any file reaches disk, and
//! unified-diff patch application for revision rounds that edit rather
//! than rewrite.
//!
//! Generalizes [`crate::presets`]'s embedded-TOML-plus-serde loading
//! mechanism from a flat list of invariant checks to a per-stack spec
//! record; the FILE-manifest and guardrail logic is new, built in the
//! same validate-before-act style the rest of the crate uses at its
//! boundaries.

pub mod diffing;
pub mod guardrails;
pub mod manifest;

use serde::Deserialize;

static STACKS_TOML: &str = include_str!("stacks.toml");

/// A named stack's expected shape: its test framework, package manager,
/// the files a correct project of this stack should contain, and any
/// libraries it must not use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StackSpec {
    pub name: String,
    pub test_framework: String,
    pub package_manager: String,
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub forbidden_libraries: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StackLibrary {
    stacks: Vec<StackSpec>,
}

/// Load the embedded stack spec library.
///
/// # Panics
/// Panics if the embedded `stacks.toml` fails to parse. This is a
/// compile-time invariant of the crate, not a runtime condition.
pub fn load_stack_specs() -> Vec<StackSpec> {
    let library: StackLibrary = toml::from_str(STACKS_TOML).expect("embedded stacks.toml is invalid");
    library.stacks
}

pub fn stack_spec_by_name(name: &str) -> Option<StackSpec> {
    load_stack_specs().into_iter().find(|s| s.name == name)
}

pub fn available_stack_names() -> Vec<String> {
    let mut names: Vec<String> = load_stack_specs().into_iter().map(|s| s.name).collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_library_parses() {
        let specs = load_stack_specs();
        assert!(!specs.is_empty());
    }

    #[test]
    fn known_stacks_are_present() {
        let names = available_stack_names();
        for expected in ["docker", "express-ts", "fastapi", "laravel", "nextjs"] {
            assert!(names.contains(&expected.to_string()), "missing stack {expected}");
        }
    }

    #[test]
    fn lookup_by_name_returns_matching_spec() {
        let spec = stack_spec_by_name("fastapi").expect("fastapi spec present");
        assert_eq!(spec.test_framework, "pytest");
        assert_eq!(spec.package_manager, "pip");
    }

    #[test]
    fn unknown_stack_name_returns_none() {
        assert!(stack_spec_by_name("cobol-cgi").is_none());
    }
}
