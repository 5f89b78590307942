//! The build backend capability and the collaborators backends share.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_config::EngineConfig;
use kiln_core::job::{BuildJob, BuildJobKind, BuildJobScheduler};
use kiln_core::{BuildRequest, BuildResponse, EventLogger, RegistryAuth, ResourceId};

use crate::{BuildError, ImageNamer};

/// Prefix of build environment variables passed to Dockerfile builds as
/// build arguments.
pub const BUILD_ARG_PREFIX: &str = "ARG_";

/// Produces an artifact from a build request.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn build(
        &self,
        request: &BuildRequest,
        logger: &EventLogger,
    ) -> Result<BuildResponse, BuildError>;
}

/// Settings shared by every backend.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub image_builder: String,
    pub slug_builder: String,
    /// Credentials for pushing to the platform registry.
    pub registry_auth: Option<RegistryAuth>,
    pub job_timeout: Duration,
}

impl BackendSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            image_builder: config.builder.image_builder.clone(),
            slug_builder: config.builder.slug_builder.clone(),
            registry_auth: config
                .registry
                .user
                .as_deref()
                .filter(|u| !u.is_empty())
                .map(|user| RegistryAuth {
                    username: user.to_string(),
                    password: config.registry.password.clone().unwrap_or_default(),
                    server: config.registry.domain.clone(),
                }),
            job_timeout: config.task_timeout,
        }
    }
}

/// Collaborators handed to every backend.
#[derive(Clone)]
pub struct BackendContext {
    pub scheduler: Arc<dyn BuildJobScheduler>,
    pub namer: ImageNamer,
    pub settings: BackendSettings,
}

impl BackendContext {
    /// Job that builds `dockerfile` (relative to the build dir) and pushes
    /// it to `destination`.
    pub(crate) fn image_job(
        &self,
        request: &BuildRequest,
        dockerfile: &str,
        destination: &str,
    ) -> BuildJob {
        BuildJob {
            id: ResourceId::new(),
            event_id: request.event_id.clone(),
            builder_image: self.settings.image_builder.clone(),
            source_dir: request.source_dir.clone(),
            cache_dir: (!request.no_cache()).then(|| request.cache_dir.clone()),
            kind: BuildJobKind::Image {
                dockerfile: dockerfile.to_string(),
                destination: destination.to_string(),
                build_args: build_args(&request.build_envs),
                registry: self.settings.registry_auth.clone(),
            },
            env: HashMap::new(),
            host_aliases: request.host_aliases.clone(),
            timeout: self.settings.job_timeout,
        }
    }
}

/// `ARG_NAME=value` build envs as `NAME=value` build arguments.
pub(crate) fn build_args(envs: &HashMap<String, String>) -> HashMap<String, String> {
    envs.iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(BUILD_ARG_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}
