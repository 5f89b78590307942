//! Generic slug bundler, also the fallback for undetected languages.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use kiln_core::job::{BuildJob, BuildJobKind};
use kiln_core::{
    BuildRequest, BuildResponse, EventLogger, EventStatus, Medium, ResourceId, path_segment,
};

use crate::{BackendContext, BuildBackend, BuildError};

/// Packages the source into a slug archive with the slug builder image.
pub struct SlugBackend {
    ctx: BackendContext,
}

fn segment<'a>(field: &str, value: &'a str) -> Result<&'a str, BuildError> {
    path_segment(field, value).map_err(|e| BuildError::InvalidRequest(e.to_string()))
}

impl SlugBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }

    /// `{slug_dir}/{tenant}/slug/{service}/{version}.tgz`
    pub fn slug_path(request: &BuildRequest) -> Result<PathBuf, BuildError> {
        Ok(request
            .slug_dir
            .join(segment("tenant_id", &request.tenant_id)?)
            .join("slug")
            .join(segment("service_id", &request.service_id)?)
            .join(format!("{}.tgz", segment("deploy_version", &request.deploy_version)?)))
    }

    fn job(&self, request: &BuildRequest, output: PathBuf, image: Option<String>) -> BuildJob {
        let mut env: HashMap<String, String> = request.build_envs.clone();
        env.insert("SERVICE_ID".to_string(), request.service_id.clone());
        env.insert("TENANT_ID".to_string(), request.tenant_id.clone());
        env.insert("DEPLOY_VERSION".to_string(), request.deploy_version.clone());
        BuildJob {
            id: ResourceId::new(),
            event_id: request.event_id.clone(),
            builder_image: self.ctx.settings.slug_builder.clone(),
            source_dir: request.source_dir.clone(),
            cache_dir: (!request.no_cache()).then(|| request.cache_dir.clone()),
            kind: BuildJobKind::Slug {
                output,
                lang: request.lang.as_str().to_string(),
                runtime: request.runtime.clone(),
                image,
            },
            env,
            host_aliases: request.host_aliases.clone(),
            timeout: self.ctx.settings.job_timeout,
        }
    }
}

#[async_trait]
impl BuildBackend for SlugBackend {
    fn name(&self) -> &'static str {
        "slug"
    }

    async fn build(
        &self,
        request: &BuildRequest,
        logger: &EventLogger,
    ) -> Result<BuildResponse, BuildError> {
        let output = Self::slug_path(request)?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let image = match request.medium_hint {
            Some(Medium::Image) => Some(
                self.ctx
                    .namer
                    .image_name(&request.service_id, &request.deploy_version)
                    .await,
            ),
            _ => None,
        };

        logger.info(
            format!("Packaging {} source", display_lang(request)),
            "build-code",
            EventStatus::Starting,
        );
        let job = self.job(request, output.clone(), image.clone());
        info!(event_id = %request.event_id, job = %job.name(), output = %output.display(), "Running slug build");
        self.ctx.scheduler.run(job).await?;

        let response = match image {
            Some(image) => BuildResponse {
                medium: Medium::Image,
                path: image,
            },
            None => BuildResponse {
                medium: Medium::Slug,
                path: output.to_string_lossy().into_owned(),
            },
        };
        logger.info(
            format!("Build produced {} {}", response.medium, response.path),
            "build-code",
            EventStatus::Success,
        );
        Ok(response)
    }
}

fn display_lang(request: &BuildRequest) -> &str {
    match request.lang.as_str() {
        "" => "undetected",
        lang => lang,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{RecordingScheduler, context, logger, request};
    use kiln_core::Language;

    #[tokio::test]
    async fn test_produces_slug() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = SlugBackend::new(context(scheduler.clone()));
        let mut req = request(tmp.path(), Language::NodeJs);
        req.runtime = Some("20".into());
        let (_, log) = logger();

        let response = backend.build(&req, &log).await.unwrap();

        let expected = tmp.path().join("slug/tenant1/slug/svc1/20240101120000.tgz");
        assert_eq!(response.medium, Medium::Slug);
        assert_eq!(response.path, expected.to_string_lossy());
        assert!(expected.parent().unwrap().is_dir());

        let jobs = scheduler.jobs();
        assert_eq!(jobs[0].builder_image, "builder:test");
        assert_eq!(jobs[0].env["SERVICE_ID"], "svc1");
        match &jobs[0].kind {
            BuildJobKind::Slug {
                lang,
                runtime,
                image,
                ..
            } => {
                assert_eq!(lang, "Node.js");
                assert_eq!(runtime.as_deref(), Some("20"));
                assert!(image.is_none());
            }
            other => panic!("unexpected job kind {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undetected_language_still_builds() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = SlugBackend::new(context(RecordingScheduler::succeeding()));
        let (_, log) = logger();

        let response = backend
            .build(&request(tmp.path(), Language::Unknown(String::new())), &log)
            .await
            .unwrap();
        assert_eq!(response.medium, Medium::Slug);
    }

    #[tokio::test]
    async fn test_image_hint_publishes_runner_image() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = SlugBackend::new(context(scheduler.clone()));
        let mut req = request(tmp.path(), Language::Python);
        req.medium_hint = Some(Medium::Image);
        let (_, log) = logger();

        let response = backend.build(&req, &log).await.unwrap();
        assert_eq!(response.medium, Medium::Image);
        assert_eq!(response.path, "goodrain.me/svc1:20240101120000");
        match &scheduler.jobs()[0].kind {
            BuildJobKind::Slug { image, .. } => assert_eq!(image.as_deref(), Some(response.path.as_str())),
            other => panic!("unexpected job kind {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ids_cannot_leave_the_slug_root() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = SlugBackend::new(context(scheduler.clone()));
        let (_, log) = logger();

        let cases = [
            ("..", "svc1", "v1"),
            ("tenant1", "", "v1"),
            ("tenant1", "svc1", "../v1"),
        ];
        for (tenant, service, version) in cases {
            let mut req = request(tmp.path(), Language::NodeJs);
            req.tenant_id = tenant.into();
            req.service_id = service.into();
            req.deploy_version = version.into();
            let err = backend.build(&req, &log).await.unwrap_err();
            assert!(
                matches!(err, BuildError::InvalidRequest(_)),
                "{tenant:?} {service:?} {version:?}"
            );
        }
        assert!(scheduler.jobs().is_empty());
    }
}
