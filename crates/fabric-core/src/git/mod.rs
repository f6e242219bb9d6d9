//! Git Coordinator: `PrepareWorktree` / `StageAndCommit` / `Push` /
//! `OpenPullRequest` / `Cleanup` for a task run.
//!
//! The most direct carry-over in the crate: [`crate::worktree::WorktreeManager`]
//! already implements idempotent worktree create/remove/list/cleanup-stale,
//! `merge_branch`, `delete_branch`, and the `Arc<Mutex<()>>` git
//! serialization lock, and is reused here unmodified as `PrepareWorktree`
//! (`create_worktree`, renamed) and `Cleanup` (`remove_worktree`).
//! `StageAndCommit`, `Push`, and `OpenPullRequest` are new: the teacher
//! commits implicitly inside `lifecycle::commit_agent_work` and never
//! pushes or opens PRs, so these are built fresh in the same
//! subprocess-and-check-exit-status style as `WorktreeManager`'s own git
//! invocations, using `tokio::process::Command` instead of the blocking
//! `std::process::Command` since the coordinator runs inside the async
//! executor pipeline.

use std::path::Path;

use thiserror::Error;
use tokio::process::Command;

use crate::worktree::{MergeResult, WorktreeError, WorktreeInfo, WorktreeManager};

/// Errors from Git Coordinator operations. Extends [`WorktreeError`] with
/// the new push/PR failure modes; all variants are meant to be reported as
/// non-fatal, typed errors per spec.md §4.4.
#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("git push failed: {0}")]
    Push(String),

    #[error("git authentication failed: {0}")]
    AuthFailed(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("pull request already exists: {0}")]
    PrExists(String),

    #[error("failed to run gh: {0}")]
    GhCommand(String),
}

/// Outcome of opening a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub url: String,
    pub number: Option<u64>,
}

/// Coordinates git operations for a task run's branch lifecycle.
#[derive(Debug, Clone)]
pub struct GitCoordinator {
    manager: WorktreeManager,
}

impl GitCoordinator {
    pub fn new(manager: WorktreeManager) -> Self {
        Self { manager }
    }

    /// Build the conventional branch name: `{prefix}/{slug}/run-{n}`.
    pub fn branch_name(prefix: &str, slug: &str, run_number: i32) -> String {
        format!("{prefix}/{slug}/run-{run_number}")
    }

    /// `PrepareWorktree`: create (or reuse, idempotently) the worktree for a
    /// run's branch.
    pub fn prepare_worktree(&self, branch_name: &str) -> Result<WorktreeInfo, GitError> {
        Ok(self.manager.create_worktree(branch_name)?)
    }

    /// `Cleanup`: remove local worktree state for a run. Leaves the remote
    /// branch and any opened PR untouched -- cleanup only tears down local
    /// state.
    pub fn cleanup(&self, info: &WorktreeInfo) -> Result<(), GitError> {
        Ok(self.manager.remove_worktree(&info.path)?)
    }

    /// `StageAndCommit`: `git add -A` followed by a commit using a message
    /// expanded from `commit_template` (`{task_name}`/`{run_number}`
    /// placeholders already substituted by the caller).
    pub async fn stage_and_commit(&self, worktree_path: &Path, message: &str) -> Result<String, GitError> {
        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| GitError::GhCommand(e.to_string()))?;
        if !add.status.success() {
            return Err(GitError::Push(String::from_utf8_lossy(&add.stderr).to_string()));
        }

        let commit = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| GitError::GhCommand(e.to_string()))?;
        if !commit.status.success() {
            let stderr = String::from_utf8_lossy(&commit.stderr).to_string();
            return Err(GitError::Push(stderr));
        }

        let rev_parse = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| GitError::GhCommand(e.to_string()))?;
        Ok(String::from_utf8_lossy(&rev_parse.stdout).trim().to_string())
    }

    /// `Push`: push the run's branch to `origin`, creating the upstream
    /// tracking ref on first push.
    pub async fn push(&self, worktree_path: &Path, branch_name: &str) -> Result<(), GitError> {
        let output = Command::new("git")
            .args(["push", "-u", "origin", branch_name])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| GitError::GhCommand(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("Authentication failed") || stderr.contains("Permission denied") {
            return Err(GitError::AuthFailed(stderr));
        }
        if stderr.contains("already exists") {
            return Err(GitError::BranchExists(branch_name.to_string()));
        }
        Err(GitError::Push(stderr))
    }

    /// `OpenPullRequest`: shell out to the `gh` CLI to open a draft PR and
    /// parse its JSON output for the URL. No GitHub SDK dependency is
    /// introduced, matching the rest of the coordinator's
    /// subprocess-and-parse shape.
    pub async fn open_pull_request(
        &self,
        worktree_path: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest, GitError> {
        let output = Command::new("gh")
            .args([
                "pr", "create", "--draft", "--title", title, "--body", body, "--base", base,
                "--json", "url,number",
            ])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| GitError::GhCommand(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("already exists") {
                return Err(GitError::PrExists(stderr));
            }
            return Err(GitError::GhCommand(stderr));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| GitError::GhCommand(format!("failed to parse gh output: {e}")))?;

        let url = parsed
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GitError::GhCommand("gh output missing url".to_string()))?
            .to_string();
        let number = parsed.get("number").and_then(|v| v.as_u64());

        Ok(PullRequest { url, number })
    }

    /// Merge a run's branch back into the base branch, surfacing conflicts
    /// as structured detail rather than a bare error (reused verbatim from
    /// `WorktreeManager::merge_branch`).
    pub fn merge(&self, branch_name: &str) -> Result<MergeResult, GitError> {
        Ok(self.manager.merge_branch(branch_name)?)
    }
}
