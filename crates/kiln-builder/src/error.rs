//! Build backend errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    MissingDockerfile(PathBuf),

    #[error("invalid build request: {0}")]
    InvalidRequest(String),

    #[error("build job failed: {0}")]
    Job(#[from] kiln_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Short message for the user-facing event log.
    pub fn user_message(&self) -> &'static str {
        match self {
            BuildError::MissingDockerfile(_) => "No Dockerfile was found in the build directory",
            BuildError::InvalidRequest(_) => "The build parameters are invalid",
            BuildError::Job(kiln_core::Error::Timeout(_)) => "The build timed out",
            BuildError::Job(_) => "The build failed, please check the build log",
            BuildError::Io(_) => "Preparing the build failed",
        }
    }
}

impl From<BuildError> for kiln_core::Error {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::MissingDockerfile(_) | BuildError::InvalidRequest(_) => {
                kiln_core::Error::InvalidInput(err.to_string())
            }
            BuildError::Job(inner) => inner,
            BuildError::Io(e) => kiln_core::Error::Internal(e.to_string()),
        }
    }
}
