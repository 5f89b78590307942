//! Core domain types and traits for the kiln build engine.
//!
//! This crate contains:
//! - Task envelopes, task types and identifiers
//! - Build requests, responses and languages
//! - The worker capability dispatched by the engine
//! - Collaborator contracts (image operations, build job scheduling,
//!   notifications, event logging, version persistence)

pub mod build;
pub mod error;
pub mod event;
pub mod id;
pub mod image;
pub mod job;
pub mod notify;
pub mod task;
pub mod version;
pub mod worker;

pub use build::{
    BuildRequest, BuildResponse, Commit, HostAlias, HostAliasResolver, Language, Medium,
    StaticHostAliases,
};
pub use error::{Error, Result};
pub use event::{EventLogger, EventSink, EventStatus};
pub use id::{ResourceId, TaskId, path_segment};
pub use image::{ImageOps, ImageRef, RegistryAuth};
pub use job::{BuildJob, BuildJobKind, BuildJobScheduler, JobHandle, JobStatus};
pub use notify::{Notifier, Outbound};
pub use task::{Task, TaskType};
pub use version::{
    FinalStatus, PluginBuildRecord, PluginBuildStatus, PluginBuildStore, VersionKey,
    VersionRecord, VersionStore, VersionUpdate, WorkloadName, WorkloadResolver,
};
pub use worker::WorkerTask;
