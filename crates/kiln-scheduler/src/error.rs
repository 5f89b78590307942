//! Engine errors.

use thiserror::Error;

/// Errors raised while assembling the engine. Task failures are
/// [`kiln_core::Error`]s.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("worker name must not be empty")]
    EmptyName,

    #[error("task type {0} is dispatched by the static table and cannot be registered")]
    ReservedName(String),

    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("max attempts for {0} must be at least 1")]
    InvalidPolicy(String),
}

impl From<SchedulerError> for kiln_core::Error {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::DuplicateWorker(_) => kiln_core::Error::Conflict(err.to_string()),
            _ => kiln_core::Error::InvalidInput(err.to_string()),
        }
    }
}
