use thiserror::Error;

/// Error taxonomy for the chat runtime.
///
/// Propagation policy: message-store errors reach the caller for user
/// notification; presence errors are logged and swallowed, because presence
/// is a best-effort enhancement that must never block messaging.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Transport failure. Recovered by the polling fallback; only the
    /// initial conversation load ever shows it to a user.
    #[error("network error: {0}")]
    Network(String),

    /// Invalid input, rejected before any network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// Mutation attempted on a message the actor does not own. Terminal.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Target already gone. Deletes treat this as a successful no-op.
    #[error("not found: {0}")]
    NotFound(String),

    /// Directory lookup failed. Non-fatal; degrades identity quality only.
    #[error("identity resolution failed: {0}")]
    IdentityResolution(String),
}

impl ChatError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
