//! Diff-mode file patching: apply a unified diff to an existing project
//! file, verifying hunk context the way a merge does. A failed hunk never
//! touches the original file -- it's left untouched and a `.mgx_new`
//! candidate is written alongside it for a human to reconcile, the same
//! structured-detail-over-bare-error-string shape as a merge conflict.
//!
//! Multi-file application comes in two modes: `BestEffort` applies each
//! diff independently and reports per-file outcomes; `AllOrNothing` takes
//! timestamped backups first and rolls every file back if any hunk fails.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fabric_db::models::ErrorKind;

use crate::error::FabricError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    AllOrNothing,
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub path: PathBuf,
    pub applied: bool,
    pub detail: Option<String>,
}

/// Apply a single unified diff to `target`. On a context mismatch the
/// original file is left exactly as it was and the raw diff is written to
/// `<target>.mgx_new` for manual review.
pub fn apply_single_diff(target: &Path, diff_text: &str) -> Result<PatchOutcome, FabricError> {
    let original = fs::read_to_string(target)
        .map_err(|e| FabricError::invalid_input(format!("cannot read {}: {e}", target.display())))?;

    let patch = diffy::Patch::from_str(diff_text).map_err(|e| {
        FabricError::invalid_input(format!("malformed unified diff for {}: {e}", target.display()))
    })?;

    match diffy::apply(&original, &patch) {
        Ok(patched) => {
            fs::write(target, patched)
                .map_err(|e| FabricError::new(ErrorKind::Internal, format!("cannot write {}: {e}", target.display())))?;
            Ok(PatchOutcome {
                path: target.to_path_buf(),
                applied: true,
                detail: None,
            })
        }
        Err(e) => {
            let candidate = PathBuf::from(format!("{}.mgx_new", target.display()));
            let _ = fs::write(&candidate, diff_text);
            Ok(PatchOutcome {
                path: target.to_path_buf(),
                applied: false,
                detail: Some(format!(
                    "hunk context mismatch: {e}; candidate diff written to {}",
                    candidate.display()
                )),
            })
        }
    }
}

/// Apply a batch of diffs under the given mode.
pub fn apply_diffs(diffs: &[(PathBuf, String)], mode: DiffMode) -> Result<Vec<PatchOutcome>, FabricError> {
    match mode {
        DiffMode::BestEffort => diffs
            .iter()
            .map(|(path, diff_text)| apply_single_diff(path, diff_text))
            .collect(),
        DiffMode::AllOrNothing => apply_all_or_nothing(diffs),
    }
}

fn apply_all_or_nothing(diffs: &[(PathBuf, String)]) -> Result<Vec<PatchOutcome>, FabricError> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (path, _) in diffs {
        if path.exists() {
            let backup_path = PathBuf::from(format!("{}.mgx_bak.{stamp}", path.display()));
            fs::copy(path, &backup_path)
                .map_err(|e| FabricError::new(ErrorKind::Internal, format!("cannot back up {}: {e}", path.display())))?;
            backups.push((path.clone(), backup_path));
        }
    }

    let mut outcomes = Vec::with_capacity(diffs.len());
    let mut all_applied = true;
    for (path, diff_text) in diffs {
        let outcome = apply_single_diff(path, diff_text)?;
        all_applied &= outcome.applied;
        outcomes.push(outcome);
    }

    if !all_applied {
        for (original, backup) in &backups {
            let _ = fs::copy(backup, original);
        }
        for (_, backup) in &backups {
            let _ = fs::remove_file(backup);
        }
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.applied)
            .map(|o| o.path.to_str().unwrap_or(""))
            .collect();
        return Err(FabricError::invalid_input(format!(
            "all-or-nothing diff application rolled back {} file(s); failed: {}",
            backups.len(),
            failed.join(", ")
        )));
    }

    for (_, backup) in &backups {
        let _ = fs::remove_file(backup);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_diff(path: &str, original: &str, updated: &str) -> String {
        diffy::create_patch(original, updated)
            .to_string()
            .replace("---\n", &format!("--- {path}\n"))
            .replacen("+++\n", &format!("+++ {path}\n"), 1)
    }

    #[test]
    fn applies_clean_diff() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "line one\nline two\n").unwrap();
        let diff = make_diff("a.txt", "line one\nline two\n", "line one\nline TWO\n");

        let outcome = apply_single_diff(&target, &diff).unwrap();
        assert!(outcome.applied);
        assert_eq!(fs::read_to_string(&target).unwrap(), "line one\nline TWO\n");
    }

    #[test]
    fn mismatched_context_leaves_original_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "completely different content\n").unwrap();
        let diff = make_diff("a.txt", "line one\nline two\n", "line one\nline TWO\n");

        let outcome = apply_single_diff(&target, &diff).unwrap();
        assert!(!outcome.applied);
        assert_eq!(fs::read_to_string(&target).unwrap(), "completely different content\n");
        assert!(dir.path().join("a.txt.mgx_new").exists());
    }

    #[test]
    fn all_or_nothing_rolls_back_on_any_failure() {
        let dir = tempdir().unwrap();
        let good_path = dir.path().join("good.txt");
        let bad_path = dir.path().join("bad.txt");
        fs::write(&good_path, "line one\n").unwrap();
        fs::write(&bad_path, "unrelated\n").unwrap();

        let good_diff = make_diff("good.txt", "line one\n", "line ONE\n");
        let bad_diff = make_diff("bad.txt", "line one\n", "line ONE\n");

        let result = apply_diffs(
            &[(good_path.clone(), good_diff), (bad_path.clone(), bad_diff)],
            DiffMode::AllOrNothing,
        );

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&good_path).unwrap(), "line one\n");
        assert_eq!(fs::read_to_string(&bad_path).unwrap(), "unrelated\n");
    }

    #[test]
    fn best_effort_applies_what_succeeds() {
        let dir = tempdir().unwrap();
        let good_path = dir.path().join("good.txt");
        let bad_path = dir.path().join("bad.txt");
        fs::write(&good_path, "line one\n").unwrap();
        fs::write(&bad_path, "unrelated\n").unwrap();

        let good_diff = make_diff("good.txt", "line one\n", "line ONE\n");
        let bad_diff = make_diff("bad.txt", "line one\n", "line ONE\n");

        let outcomes = apply_diffs(
            &[(good_path.clone(), good_diff), (bad_path.clone(), bad_diff)],
            DiffMode::BestEffort,
        )
        .unwrap();

        assert!(outcomes[0].applied);
        assert!(!outcomes[1].applied);
        assert_eq!(fs::read_to_string(&good_path).unwrap(), "line ONE\n");
        assert_eq!(fs::read_to_string(&bad_path).unwrap(), "unrelated\n");
    }
}
