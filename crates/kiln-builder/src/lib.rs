//! Build backends for kiln.
//!
//! A backend turns a [`kiln_core::BuildRequest`] into a
//! [`kiln_core::BuildResponse`] by describing a build job and running it on
//! the external job scheduler. Backends are selected by language through a
//! [`BackendRegistry`].

pub mod backend;
pub mod dockerfile;
pub mod error;
pub mod naming;
pub mod registry;
pub mod runtime;
pub mod slug;

pub use backend::{BackendContext, BackendSettings, BuildBackend};
pub use dockerfile::DockerfileBackend;
pub use error::BuildError;
pub use naming::ImageNamer;
pub use registry::BackendRegistry;
pub use runtime::RuntimeBackend;
pub use slug::SlugBackend;
