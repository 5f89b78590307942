//! Source acquisition for kiln builds.
//!
//! This crate handles:
//! - Repository resolution (kind, branch, build subdirectory, cache root)
//! - Fetching from git, svn and object storage archives
//! - Language detection on a fetched tree

pub mod detect;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod oss;
pub mod repo;
pub mod runner;
pub mod svn;

pub use detect::detect_language;
pub use error::FetchError;
pub use fetcher::{FetchOptions, FetchSettings, SourceFetcher};
pub use repo::{BranchRef, RepositoryInfo, VcsKind};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
