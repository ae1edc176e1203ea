//! Error types for Cadence.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("circular dependency: {0}")]
    CircularDependency(String),

    #[error("maximum retry count exceeded: {0}")]
    MaxRetryExceeded(String),

    #[error("job is inactive: {0}")]
    Inactive(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("cancelled")]
    ExecutionCancelled,

    #[error("integration failure: {0}")]
    TransientIntegration(String),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("execution failed: {0}")]
    PermanentFailure(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error rejects an operation because of the current lifecycle state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Error::InvalidState(_) | Error::CircularDependency(_) | Error::MaxRetryExceeded(_)
        )
    }

    /// Whether the error came from a remote integration and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIntegration(_) | Error::CircuitOpen(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
