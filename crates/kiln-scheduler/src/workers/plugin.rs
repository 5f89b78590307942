//! `plugin-image-build` and `plugin-dockerfile-build`

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use kiln_core::{
    BuildJob, BuildJobKind, Error, EventLogger, EventStatus, PluginBuildRecord, PluginBuildStatus,
    ResourceId, Result, Task, TaskType, WorkerTask,
};
use kiln_source::fetcher::Credentials;
use kiln_source::{FetchOptions, RepositoryInfo};

use crate::payload::{PluginDockerfilePayload, PluginImagePayload};
use crate::WorkerContext;

const DOCKERFILE: &str = "Dockerfile";

/// Image every version of a plugin is published as.
fn plugin_image(ctx: &WorkerContext, plugin_id: &str, version_id: &str) -> String {
    ctx.build
        .namer
        .qualify(&format!("plugin-{}", plugin_id), version_id)
}

async fn put_status(
    ctx: &WorkerContext,
    plugin_id: &str,
    version_id: &str,
    event_id: &str,
    status: PluginBuildStatus,
    image: Option<String>,
) -> Result<()> {
    ctx.plugins
        .put(PluginBuildRecord {
            plugin_id: plugin_id.to_string(),
            version_id: version_id.to_string(),
            event_id: event_id.to_string(),
            status,
            image,
            updated_at: Utc::now(),
        })
        .await
}

/// Failure marker. Errors are logged only: the task is already failing.
async fn mark_failed(ctx: &WorkerContext, plugin_id: &str, version_id: &str, event_id: &str) {
    if let Err(e) = put_status(
        ctx,
        plugin_id,
        version_id,
        event_id,
        PluginBuildStatus::Failure,
        None,
    )
    .await
    {
        warn!(plugin_id, version_id, error = %e, "Failed to record plugin build failure");
    }
}

/// Republishes a prebuilt plugin image under the platform registry.
pub struct PluginImageWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: PluginImagePayload,
}

impl PluginImageWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
        })
    }
}

#[async_trait]
impl WorkerTask for PluginImageWorker {
    fn name(&self) -> &str {
        TaskType::PluginImageBuild.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let ops = &self.ctx.image_ops;
        let timeout = self.ctx.registry_timeout();
        put_status(
            &self.ctx,
            &p.plugin_id,
            &p.version_id,
            &p.event_id,
            PluginBuildStatus::Building,
            None,
        )
        .await?;

        let auth = self
            .ctx
            .pull_auth(&p.image_url, p.user.as_deref(), p.password.as_deref());
        ops.pull(&p.image_url, auth.as_ref(), &self.logger, timeout)
            .await?;
        let target = plugin_image(&self.ctx, &p.plugin_id, &p.version_id);
        ops.tag(&p.image_url, &target, &self.logger, timeout).await?;
        ops.push(&target, self.ctx.platform_auth(), &self.logger, timeout)
            .await?;

        put_status(
            &self.ctx,
            &p.plugin_id,
            &p.version_id,
            &p.event_id,
            PluginBuildStatus::Complete,
            Some(target.clone()),
        )
        .await?;
        self.logger.info(
            format!("Plugin image {} is ready", target),
            "build-plugin",
            EventStatus::Success,
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        super::interrupted(&self.logger)
    }

    async fn on_error(&self, _err: &Error) {
        let p = &self.payload;
        mark_failed(&self.ctx, &p.plugin_id, &p.version_id, &p.event_id).await;
    }
}

/// Builds a plugin from the Dockerfile at the root of its repository.
pub struct PluginDockerfileWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: PluginDockerfilePayload,
}

impl PluginDockerfileWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
        })
    }

    async fn build(&self, repo: &RepositoryInfo) -> Result<String> {
        let p = &self.payload;
        let opts = FetchOptions {
            tenant_id: p.tenant_id.clone(),
            credentials: Credentials::new(p.user.as_deref(), p.password.as_deref()),
            no_cache: true,
        };
        if let Err(e) = self.ctx.fetcher.fetch(repo, &opts).await {
            self.logger.error(e.user_message(), "fetch");
            return Err(e.into());
        }

        let source_dir = repo.build_dir();
        if !tokio::fs::try_exists(source_dir.join(DOCKERFILE))
            .await
            .unwrap_or(false)
        {
            self.logger
                .error("The plugin repository has no Dockerfile", "build-plugin");
            return Err(Error::InvalidInput(format!(
                "no Dockerfile in {}",
                source_dir.display()
            )));
        }

        let destination = plugin_image(&self.ctx, &p.plugin_id, &p.version_id);
        let settings = &self.ctx.build.settings;
        let job = BuildJob {
            id: ResourceId::new(),
            event_id: p.event_id.clone(),
            builder_image: settings.image_builder.clone(),
            source_dir,
            cache_dir: None,
            kind: BuildJobKind::Image {
                dockerfile: DOCKERFILE.to_string(),
                destination: destination.clone(),
                build_args: p.build_envs.clone(),
                registry: settings.registry_auth.clone(),
            },
            env: Default::default(),
            host_aliases: Vec::new(),
            timeout: settings.job_timeout,
        };
        self.logger.info(
            format!("Building plugin image {}", destination),
            "build-plugin",
            EventStatus::Starting,
        );
        info!(plugin_id = %p.plugin_id, job = %job.name(), "Running plugin Dockerfile build");
        self.ctx.build.scheduler.run(job).await?;
        Ok(destination)
    }
}

#[async_trait]
impl WorkerTask for PluginDockerfileWorker {
    fn name(&self) -> &str {
        TaskType::PluginDockerfileBuild.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        put_status(
            &self.ctx,
            &p.plugin_id,
            &p.version_id,
            &p.event_id,
            PluginBuildStatus::Building,
            None,
        )
        .await?;

        let repo = match RepositoryInfo::resolve(
            &p.git_url,
            &p.branch,
            "git",
            &p.tenant_id,
            &p.plugin_id,
            &self.ctx.config.paths.source_dir,
        ) {
            Ok(repo) => repo,
            Err(e) => {
                self.logger.error(e.user_message(), "resolve");
                return Err(e.into());
            }
        };
        let _workspace = self.ctx.fetcher.lock_workspace(&repo).await;
        let built = self.build(&repo).await;
        self.ctx.fetcher.cleanup(&repo).await;
        let image = built?;

        put_status(
            &self.ctx,
            &p.plugin_id,
            &p.version_id,
            &p.event_id,
            PluginBuildStatus::Complete,
            Some(image.clone()),
        )
        .await?;
        self.logger.info(
            format!("Plugin image {} is ready", image),
            "build-plugin",
            EventStatus::Success,
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        super::interrupted(&self.logger)
    }

    async fn on_error(&self, _err: &Error) {
        let p = &self.payload;
        mark_failed(&self.ctx, &p.plugin_id, &p.version_id, &p.event_id).await;
    }
}
