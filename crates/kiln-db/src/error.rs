//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for kiln_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => kiln_core::Error::NotFound(what),
            // Connection loss and pool exhaustion are worth another attempt.
            other => kiln_core::Error::Internal(other.to_string()),
        }
    }
}
