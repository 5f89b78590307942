//! Fetch errors.

use thiserror::Error;

/// Source fetch failures, one variant per category users see.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid repository url: {0}")]
    InvalidUrl(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("ssh authentication failed: {0}")]
    SshAuthFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("remote repository is empty: {0}")]
    EmptyRepository(String),

    #[error("branch or tag not found: {0}")]
    BranchNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Short message for the user-facing event log.
    pub fn user_message(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "The repository address is invalid",
            FetchError::InvalidId(_) => "The tenant id is invalid",
            FetchError::AuthRequired(_) => {
                "The repository requires authentication, please check the account and password"
            }
            FetchError::SshAuthFailed(_) => {
                "SSH authentication failed, please add the deploy key to the repository"
            }
            FetchError::AuthorizationFailed(_) => {
                "The account is not authorized to access the repository"
            }
            FetchError::RepositoryNotFound(_) => "The repository does not exist",
            FetchError::EmptyRepository(_) => "The remote repository is empty",
            FetchError::BranchNotFound(_) => "The branch or tag does not exist",
            FetchError::Timeout(_) => "Fetching the source timed out",
            FetchError::Download(_) => "Downloading the source package failed",
            FetchError::Unsupported(_) => "The source type is not supported",
            FetchError::Command(_) | FetchError::Io(_) => "Fetching the source failed",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else {
            FetchError::Download(err.to_string())
        }
    }
}

impl From<FetchError> for kiln_core::Error {
    fn from(err: FetchError) -> Self {
        use kiln_core::Error;
        match err {
            FetchError::InvalidUrl(_)
            | FetchError::InvalidId(_)
            | FetchError::RepositoryNotFound(_)
            | FetchError::EmptyRepository(_)
            | FetchError::BranchNotFound(_)
            | FetchError::Unsupported(_) => Error::InvalidInput(err.to_string()),
            FetchError::AuthRequired(_) | FetchError::SshAuthFailed(_) => {
                Error::Unauthorized(err.to_string())
            }
            FetchError::AuthorizationFailed(_) => Error::Forbidden(err.to_string()),
            FetchError::Timeout(_) => Error::Timeout(err.to_string()),
            FetchError::Command(_) | FetchError::Download(_) | FetchError::Io(_) => {
                Error::ExecutionFailed(err.to_string())
            }
        }
    }
}
