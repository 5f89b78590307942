//! Error types for kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Transient infrastructure failures (network, registry, auth) are
    /// retryable. Bad input, missing resources and recovered panics are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ExecutionFailed(_)
                | Error::Timeout(_)
                | Error::Internal(_)
                | Error::Unauthorized(_)
                | Error::Forbidden(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
