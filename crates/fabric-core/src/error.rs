//! Fabric-wide error taxonomy.
//!
//! [`FabricError`] wraps [`fabric_db::models::ErrorKind`] with a message,
//! giving every port (`Agent`, `SandboxRuntime`, `GitHost`, `Completion`) a
//! single structured error type callers can match on by kind rather than by
//! string, while the rest of the crate keeps using `anyhow::Result` at the
//! service boundary.

use fabric_db::models::ErrorKind;

/// A structured error carrying the taxonomy kind from spec.md §7.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FabricError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FabricError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn budget_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetExhausted, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    /// Whether retrying the operation that produced this error could plausibly
    /// succeed. Mirrors the fatal/non-fatal split threaded through the
    /// revision loop and the multi-agent failover policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::InvalidInput | ErrorKind::BudgetExhausted | ErrorKind::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_is_not_retryable() {
        let err = FabricError::invalid_input("bad config");
        assert!(!err.is_retryable());
    }

    #[test]
    fn sandbox_failed_is_retryable() {
        let err = FabricError::new(ErrorKind::SandboxFailed, "container exited 137");
        assert!(err.is_retryable());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = FabricError::not_found("run abc123 not found");
        assert_eq!(err.to_string(), "not_found: run abc123 not found");
    }
}
