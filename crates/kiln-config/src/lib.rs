//! Configuration for the kiln build engine.
//!
//! This crate handles:
//! - Engine configuration (KDL file plus environment overrides)
//! - Dockerfile template interpolation

pub mod engine;
pub mod error;
pub mod template;

pub use engine::{
    BuilderConfig, EngineConfig, GitConfig, ImageRuntimeKind, PathsConfig, RegistryConfig,
    SchedulerKind, SourceMirrorConfig, parse_engine_config,
};
pub use error::{ConfigError, ConfigResult};
pub use template::Template;
