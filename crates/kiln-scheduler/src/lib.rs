//! Task execution engine for kiln.
//!
//! Tasks arrive as typed envelopes from an upstream message source. The
//! engine admits them against a fixed number of slots, dispatches each to
//! the worker registered for its type, retries transient failures, isolates
//! panics and drains in-flight work on shutdown.
//!
//! The built-in workers cover source builds, image builds, market slugs,
//! source checks, plugin builds, shares and garbage collection.

pub mod context;
pub mod engine;
pub mod error;
pub mod notify;
pub mod payload;
pub mod pipeline;
pub mod policy;
pub mod recorder;
pub mod registry;
pub mod stats;
pub mod workers;

pub use context::{Collaborators, WorkerContext};
pub use engine::{Admission, PANIC_USER_MESSAGE, TaskEngine};
pub use error::SchedulerError;
pub use notify::{ChannelNotifier, Delivery};
pub use pipeline::{PipelineOutput, SourcePipeline};
pub use policy::{RetryPolicy, SlotMode, TaskPolicy};
pub use recorder::VersionRecorder;
pub use registry::{Registration, WorkerFactory, WorkerRegistry};
pub use stats::{EngineStats, RunningTask};
