//! Wires the concrete collaborators selected by the configuration.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use kiln_config::{EngineConfig, ImageRuntimeKind, SchedulerKind};
use kiln_core::event::TracingEventSink;
use kiln_core::{
    BuildJobScheduler, HostAliasResolver, ImageOps, Notifier, PluginBuildStore, StaticHostAliases,
    VersionStore, WorkloadResolver,
};
use kiln_db::{MemoryStore, PgPluginBuildStore, PgVersionStore, PgWorkloadResolver};
use kiln_executor::{
    DockerImageOps, DockerJobScheduler, EndpointHostAliasResolver, KubernetesJobScheduler,
    NerdctlImageOps,
};
use kiln_scheduler::Collaborators;
use kiln_source::ProcessRunner;

struct Stores {
    versions: Arc<dyn VersionStore>,
    plugins: Arc<dyn PluginBuildStore>,
    workloads: Arc<dyn WorkloadResolver>,
}

async fn stores(database_url: Option<&str>) -> Result<Stores> {
    let Some(url) = database_url else {
        info!("No database configured, keeping version records in memory");
        let memory = Arc::new(MemoryStore::new());
        return Ok(Stores {
            versions: memory.clone(),
            plugins: memory.clone(),
            workloads: memory,
        });
    };

    info!("Connecting to database...");
    let pool = kiln_db::create_pool(url)
        .await
        .context("Failed to connect to database")?;
    kiln_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database connected");
    Ok(Stores {
        versions: Arc::new(PgVersionStore::new(pool.clone())),
        plugins: Arc::new(PgPluginBuildStore::new(pool.clone())),
        workloads: Arc::new(PgWorkloadResolver::new(pool)),
    })
}

async fn job_scheduler(config: &EngineConfig) -> Result<Arc<dyn BuildJobScheduler>> {
    Ok(match config.builder.scheduler {
        SchedulerKind::Kubernetes => Arc::new(
            KubernetesJobScheduler::new(config.builder.namespace.clone())
                .await
                .context("Failed to connect to Kubernetes")?,
        ),
        SchedulerKind::Docker => {
            Arc::new(DockerJobScheduler::new().context("Failed to connect to Docker")?)
        }
    })
}

fn image_ops(config: &EngineConfig) -> Result<Arc<dyn ImageOps>> {
    Ok(match config.builder.image_runtime {
        ImageRuntimeKind::Docker => {
            Arc::new(DockerImageOps::new().context("Failed to connect to Docker")?)
        }
        ImageRuntimeKind::Containerd => Arc::new(NerdctlImageOps::default()),
    })
}

async fn host_aliases(config: &EngineConfig) -> Result<Arc<dyn HostAliasResolver>> {
    match &config.source_mirror {
        Some(mirror) if config.builder.scheduler == SchedulerKind::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?;
            Ok(Arc::new(EndpointHostAliasResolver::new(
                client,
                mirror.service.clone(),
                mirror.namespace.clone(),
                mirror.hosts.clone(),
            )))
        }
        _ => Ok(Arc::new(StaticHostAliases::default())),
    }
}

/// Collaborators for `config`, publishing through `notifier`.
pub async fn build(
    config: &EngineConfig,
    database_url: Option<&str>,
    notifier: Arc<dyn Notifier>,
) -> Result<Collaborators> {
    let stores = stores(database_url).await?;
    let jobs = job_scheduler(config).await?;
    let image_ops = image_ops(config)?;
    info!(
        scheduler = jobs.name(),
        image_runtime = image_ops.runtime(),
        "Collaborators ready"
    );

    Ok(Collaborators {
        runner: Arc::new(ProcessRunner),
        jobs,
        image_ops,
        versions: stores.versions,
        plugins: stores.plugins,
        workloads: stores.workloads,
        notifier,
        host_aliases: host_aliases(config).await?,
        events: Arc::new(TracingEventSink),
    })
}
