//! Concrete collaborators for the kiln engine.
//!
//! - Build job schedulers: Kubernetes batch Jobs (production) and local
//!   Docker containers (development)
//! - Image operations: Docker daemon and containerd
//! - Host alias resolution from the source mirror's endpoints

pub mod containerd;
pub mod docker;
pub mod kubernetes;
pub mod spec;

pub use containerd::NerdctlImageOps;
pub use docker::{DockerImageOps, DockerJobScheduler};
pub use kubernetes::{EndpointHostAliasResolver, KubernetesJobScheduler};
pub use spec::{ContainerSpec, Mount};
