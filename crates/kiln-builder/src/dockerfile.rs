//! Dockerfile pass-through backend.

use async_trait::async_trait;
use tracing::info;

use kiln_core::{BuildRequest, BuildResponse, EventLogger, EventStatus, Medium};

use crate::{BackendContext, BuildBackend, BuildError};

const DOCKERFILE: &str = "Dockerfile";

/// Builds the user's own Dockerfile on the external job scheduler.
pub struct DockerfileBackend {
    ctx: BackendContext,
}

impl DockerfileBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BuildBackend for DockerfileBackend {
    fn name(&self) -> &'static str {
        "dockerfile"
    }

    async fn build(
        &self,
        request: &BuildRequest,
        logger: &EventLogger,
    ) -> Result<BuildResponse, BuildError> {
        let path = request.source_dir.join(DOCKERFILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BuildError::MissingDockerfile(path));
        }

        let image = self
            .ctx
            .namer
            .image_name(&request.service_id, &request.deploy_version)
            .await;
        logger.info(
            format!("Building image {} from Dockerfile", image),
            "build-image",
            EventStatus::Starting,
        );

        let job = self.ctx.image_job(request, DOCKERFILE, &image);
        info!(event_id = %request.event_id, job = %job.name(), image = %image, "Running Dockerfile build");
        self.ctx.scheduler.run(job).await?;

        logger.info(
            format!("Image {} built and pushed", image),
            "build-image",
            EventStatus::Success,
        );
        Ok(BuildResponse {
            medium: Medium::Image,
            path: image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{RecordingScheduler, context, logger, request};
    use kiln_core::job::BuildJobKind;
    use kiln_core::Language;

    #[tokio::test]
    async fn test_builds_image_from_dockerfile() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Dockerfile"), "FROM alpine").unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = DockerfileBackend::new(context(scheduler.clone()));

        let mut req = request(tmp.path(), Language::Dockerfile);
        req.build_envs.insert("ARG_VERSION".into(), "1.0".into());
        let (sink, log) = logger();
        let response = backend.build(&req, &log).await.unwrap();

        assert_eq!(response.medium, Medium::Image);
        assert_eq!(response.path, "goodrain.me/svc1:20240101120000");
        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        match &jobs[0].kind {
            BuildJobKind::Image {
                dockerfile,
                destination,
                build_args,
                ..
            } => {
                assert_eq!(dockerfile, "Dockerfile");
                assert_eq!(destination, &response.path);
                assert_eq!(build_args.get("VERSION").map(String::as_str), Some("1.0"));
            }
            other => panic!("unexpected job kind {other:?}"),
        }
        assert!(jobs[0].cache_dir.is_some());
        assert!(!sink.lines_for("ev-1").is_empty());
    }

    #[tokio::test]
    async fn test_missing_dockerfile() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = DockerfileBackend::new(context(scheduler.clone()));
        let (_, log) = logger();

        let err = backend
            .build(&request(tmp.path(), Language::Dockerfile), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingDockerfile(_)));
        assert!(scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_no_cache_drops_cache_mount() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Dockerfile"), "FROM alpine").unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = DockerfileBackend::new(context(scheduler.clone()));
        let mut req = request(tmp.path(), Language::Docker);
        req.build_envs.insert("NO_CACHE".into(), "true".into());
        let (_, log) = logger();

        backend.build(&req, &log).await.unwrap();
        assert!(scheduler.jobs()[0].cache_dir.is_none());
    }

    #[tokio::test]
    async fn test_job_failure_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Dockerfile"), "FROM alpine").unwrap();
        let backend = DockerfileBackend::new(context(RecordingScheduler::failing("exit 1")));
        let (_, log) = logger();

        let err = backend
            .build(&request(tmp.path(), Language::Dockerfile), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Job(kiln_core::Error::ExecutionFailed(_))));
    }
}
