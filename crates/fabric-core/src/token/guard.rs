//! Agent mode guards for CLI command access control.
//!
//! The guard system enforces the trust model:
//! - Operator mode (default): full command surface, no agent token set
//! - Agent mode (FABRIC_AGENT_TOKEN set): restricted to task/check/progress/done

use super::{TokenClaims, TokenConfig, TokenError, validate_token};

/// Environment variable name for the agent token.
pub const AGENT_TOKEN_ENV: &str = "FABRIC_AGENT_TOKEN";

/// Errors from mode guard checks.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("this command is not available in agent mode")]
    AgentModeBlocked,

    #[error("this command requires agent mode (FABRIC_AGENT_TOKEN must be set)")]
    NotInAgentMode,

    #[error("invalid agent token: {0}")]
    InvalidToken(#[from] TokenError),
}

/// Require that we are NOT in agent mode (i.e., FABRIC_AGENT_TOKEN is not set).
///
/// This is used to guard operator-only commands. If an agent token is
/// present in the environment, this function returns an error to prevent
/// agents from executing operator commands.
pub fn require_operator_mode() -> Result<(), GuardError> {
    require_operator_mode_with_value(std::env::var(AGENT_TOKEN_ENV).ok())
}

/// Check operator mode given an explicit token value (testable without env vars).
///
/// Returns `Err(GuardError::AgentModeBlocked)` if `token_value` is `Some`.
pub fn require_operator_mode_with_value(token_value: Option<String>) -> Result<(), GuardError> {
    if token_value.is_some() {
        return Err(GuardError::AgentModeBlocked);
    }
    Ok(())
}

/// Require that we ARE in agent mode with a valid token.
///
/// This reads `FABRIC_AGENT_TOKEN` from the environment, validates it
/// against the provided TokenConfig, and returns the extracted claims
/// (task_id and attempt) on success.
///
/// Returns an error if:
/// - The agent token environment variable is not set
/// - The token is malformed or has an invalid HMAC
pub fn require_agent_mode(config: &TokenConfig) -> Result<TokenClaims, GuardError> {
    let token = std::env::var(AGENT_TOKEN_ENV).map_err(|_| GuardError::NotInAgentMode)?;
    require_agent_mode_with_value(config, &token)
}

/// Check agent mode given an explicit token string (testable without env vars).
///
/// Validates the token against the provided `TokenConfig` and returns claims
/// on success.
pub fn require_agent_mode_with_value(
    config: &TokenConfig,
    token: &str,
) -> Result<TokenClaims, GuardError> {
    let claims = validate_token(config, token)?;
    Ok(claims)
}

/// Check whether we are currently in agent mode (token is set in env).
///
/// This does NOT validate the token; it only checks for its presence.
/// Use `require_agent_mode` for full validation.
pub fn is_agent_mode() -> bool {
    std::env::var(AGENT_TOKEN_ENV).is_ok()
}
