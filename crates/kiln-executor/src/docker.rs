//! Local Docker job scheduler and Docker daemon image operations.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{
    CreateImageOptions, ImportImageOptions, PushImageOptions, RemoveImageOptions,
    TagImageOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use chrono::Utc;
use futures::StreamExt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use kiln_core::job::{BuildJob, BuildJobScheduler, JobHandle, JobStatus};
use kiln_core::{Error, EventLogger, EventStatus, ImageOps, ImageRef, RegistryAuth, Result};

use crate::spec::ContainerSpec;

fn connect() -> Result<Docker> {
    Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))
}

/// Runs build jobs as containers on the local Docker daemon. For
/// development and single-node installs.
pub struct DockerJobScheduler {
    docker: Docker,
}

impl DockerJobScheduler {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        Ok(Self { docker: connect()? })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Container options for a build job.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let binds: Vec<String> = spec
        .mounts
        .iter()
        .map(|m| {
            let mode = if m.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", m.host.display(), m.container, mode)
        })
        .collect();
    let extra_hosts: Vec<String> = spec
        .host_aliases
        .iter()
        .flat_map(|a| a.hostnames.iter().map(move |h| format!("{}:{}", h, a.ip)))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        entrypoint: (!spec.command.is_empty()).then(|| spec.command.clone()),
        cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        working_dir: spec.working_dir.clone(),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            extra_hosts: (!extra_hosts.is_empty()).then_some(extra_hosts),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn parse_time(value: Option<String>) -> Option<chrono::DateTime<Utc>> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl BuildJobScheduler for DockerJobScheduler {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn submit(&self, job: BuildJob) -> Result<JobHandle> {
        let container_name = job.name();
        let spec = ContainerSpec::from_job(&job);

        info!(image = %spec.image, "Pulling builder image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: spec.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(result) = pull.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => warn!(error = %e, "Pull warning"),
            }
        }

        info!(container = %container_name, "Creating build container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                container_config(&spec),
            )
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(JobHandle {
            id: job.id,
            scheduler_id: container_name,
            scheduler_name: self.name().to_string(),
        })
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let inspect = self
            .docker
            .inspect_container(&handle.scheduler_id, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;
        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("Container has no state".to_string()))?;

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: parse_time(state.started_at).unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false)
            || state.status == Some(ContainerStateStatusEnum::CREATED)
        {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);
            if exit_code == Some(0) {
                JobStatus::Succeeded { finished_at }
            } else {
                JobStatus::Failed {
                    finished_at,
                    exit_code,
                    message: state
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("exit code {}", exit_code.unwrap_or(-1))),
                }
            }
        };
        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobStatus> {
        let current = self.status(handle).await?;
        if current.is_terminal() {
            return Ok(current);
        }

        let mut stream = self.docker.wait_container(
            &handle.scheduler_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        if let Some(Err(e)) = stream.next().await {
            // A non-zero exit is reported as an error by the wait endpoint;
            // the inspect below has the details.
            debug!(error = %e, "Wait returned error");
        }
        self.status(handle).await
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&handle.scheduler_id, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }
}

/// Image operations against the Docker daemon.
pub struct DockerImageOps {
    docker: Docker,
}

impl DockerImageOps {
    pub fn new() -> Result<Self> {
        Ok(Self { docker: connect()? })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn credentials(auth: Option<&RegistryAuth>) -> Option<DockerCredentials> {
    auth.map(|a| DockerCredentials {
        username: Some(a.username.clone()),
        password: Some(a.password.clone()),
        serveraddress: Some(a.server.clone()),
        ..Default::default()
    })
}

async fn with_timeout<T>(
    what: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(format!("{} timed out after {:?}", what, timeout)))?
}

#[async_trait]
impl ImageOps for DockerImageOps {
    fn runtime(&self) -> &'static str {
        "docker"
    }

    async fn pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.info(format!("Pulling image {}", image), "pull-image", EventStatus::Running);
        let reference = ImageRef::parse(image);
        with_timeout("image pull", timeout, async {
            let mut stream = self.docker.create_image(
                Some(CreateImageOptions {
                    from_image: reference.repository.clone(),
                    tag: reference.tag.clone(),
                    ..Default::default()
                }),
                None,
                credentials(auth),
            );
            while let Some(progress) = stream.next().await {
                let progress = progress
                    .map_err(|e| Error::ExecutionFailed(format!("pull {}: {}", image, e)))?;
                if let Some(error) = progress.error {
                    return Err(Error::ExecutionFailed(format!("pull {}: {}", image, error)));
                }
                if let Some(status) = progress.status {
                    logger.debug(status, "pull-image");
                }
            }
            Ok(())
        })
        .await
    }

    async fn push(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.info(format!("Pushing image {}", image), "push-image", EventStatus::Running);
        let reference = ImageRef::parse(image);
        with_timeout("image push", timeout, async {
            let mut stream = std::pin::pin!(self.docker.push_image(
                &reference.repository,
                Some(PushImageOptions {
                    tag: reference.tag.clone(),
                }),
                credentials(auth),
            ));
            while let Some(progress) = stream.next().await {
                let progress = progress
                    .map_err(|e| Error::ExecutionFailed(format!("push {}: {}", image, e)))?;
                if let Some(error) = progress.error {
                    return Err(Error::ExecutionFailed(format!("push {}: {}", image, error)));
                }
                if let Some(status) = progress.status {
                    logger.debug(status, "push-image");
                }
            }
            Ok(())
        })
        .await
    }

    async fn tag(
        &self,
        source: &str,
        target: &str,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.debug(format!("Tagging {} as {}", source, target), "tag-image");
        let reference = ImageRef::parse(target);
        with_timeout("image tag", timeout, async {
            self.docker
                .tag_image(
                    source,
                    Some(TagImageOptions {
                        repo: reference.repository.clone(),
                        tag: reference.tag.clone(),
                    }),
                )
                .await
                .map_err(|e| Error::ExecutionFailed(format!("tag {}: {}", source, e)))
        })
        .await
    }

    async fn remove(&self, image: &str, logger: &EventLogger, timeout: Duration) -> Result<()> {
        logger.debug(format!("Removing image {}", image), "remove-image");
        with_timeout("image remove", timeout, async {
            match self
                .docker
                .remove_image(
                    image,
                    Some(RemoveImageOptions {
                        force: true,
                        ..Default::default()
                    }),
                    None,
                )
                .await
            {
                Ok(_) => Ok(()),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => Ok(()),
                Err(e) => Err(Error::ExecutionFailed(format!("remove {}: {}", image, e))),
            }
        })
        .await
    }

    async fn save(
        &self,
        image: &str,
        dest: &Path,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.info(
            format!("Saving image {} to {}", image, dest.display()),
            "save-image",
            EventStatus::Running,
        );
        with_timeout("image save", timeout, async {
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| Error::Internal(format!("create {}: {}", dest.display(), e)))?;
            let mut stream = std::pin::pin!(self.docker.export_image(image));
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| Error::ExecutionFailed(format!("save {}: {}", image, e)))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::Internal(format!("write {}: {}", dest.display(), e)))?;
            }
            file.flush()
                .await
                .map_err(|e| Error::Internal(format!("write {}: {}", dest.display(), e)))
        })
        .await
    }

    async fn load(&self, src: &Path, logger: &EventLogger, timeout: Duration) -> Result<()> {
        logger.info(
            format!("Loading images from {}", src.display()),
            "load-image",
            EventStatus::Running,
        );
        with_timeout("image load", timeout, async {
            let archive = tokio::fs::read(src)
                .await
                .map_err(|e| Error::Internal(format!("read {}: {}", src.display(), e)))?;
            let mut stream = std::pin::pin!(self.docker.import_image(
                ImportImageOptions { quiet: true },
                bytes::Bytes::from(archive),
                None,
            ));
            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(|e| {
                    Error::ExecutionFailed(format!("load {}: {}", src.display(), e))
                })?;
                if let Some(error) = progress.error {
                    return Err(Error::ExecutionFailed(format!(
                        "load {}: {}",
                        src.display(),
                        error
                    )));
                }
            }
            Ok(())
        })
        .await
    }
}
