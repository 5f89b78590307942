//! Runtime backends: render a Dockerfile from a template for languages whose
//! images need a generated build recipe, then build it like a user
//! Dockerfile.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{info, warn};

use kiln_config::Template;
use kiln_core::{BuildRequest, BuildResponse, EventLogger, EventStatus, Medium};

use crate::{BackendContext, BuildBackend, BuildError};

/// Name of the rendered Dockerfile, written into the source tree for the
/// duration of the build.
pub const GENERATED_DOCKERFILE: &str = ".kiln.Dockerfile";

const NETCORE_TEMPLATE: &str = r#"FROM ${BUILD_IMAGE:mcr.microsoft.com/dotnet/sdk}:${SDK_VERSION:8.0} AS builder
WORKDIR /app
COPY . .
RUN ${RESTORE_COMMAND:dotnet restore}
RUN dotnet publish ${PROJECT_FILE:} -c ${BUILD_CONFIGURATION:Release} -o /out

FROM ${RUNTIME_IMAGE:mcr.microsoft.com/dotnet/aspnet}:${RUNTIME_VERSION:8.0}
WORKDIR /app
COPY --from=builder /out/ .
ENV ASPNETCORE_URLS=http://+:${PORT:5000}
EXPOSE ${PORT:5000}
CMD ["dotnet", "${ENTRY_DLL:app.dll}"]
"#;

/// Builds an image from a templated Dockerfile.
pub struct RuntimeBackend {
    name: &'static str,
    template: Template,
    ctx: BackendContext,
}

impl RuntimeBackend {
    pub fn new(name: &'static str, template: Template, ctx: BackendContext) -> Self {
        Self {
            name,
            template,
            ctx,
        }
    }

    /// The .NET runtime backend.
    pub fn netcore(ctx: BackendContext) -> Self {
        Self::new("netcore", Template::new(NETCORE_TEMPLATE), ctx)
    }

    /// Template variables from the request. Build envs win over the
    /// declared runtime version.
    fn variables(request: &BuildRequest) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        if let Some(runtime) = request.runtime.as_deref().filter(|r| !r.is_empty()) {
            vars.insert("SDK_VERSION".to_string(), runtime.to_string());
            vars.insert("RUNTIME_VERSION".to_string(), runtime.to_string());
        }
        for (k, v) in &request.build_envs {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }

    async fn build_rendered(
        &self,
        request: &BuildRequest,
        logger: &EventLogger,
        image: &str,
    ) -> Result<(), BuildError> {
        let job = self.ctx.image_job(request, GENERATED_DOCKERFILE, image);
        info!(event_id = %request.event_id, job = %job.name(), backend = self.name, "Running runtime build");
        logger.info(
            format!("Building {} image {}", self.name, image),
            "build-image",
            EventStatus::Starting,
        );
        self.ctx.scheduler.run(job).await?;
        Ok(())
    }
}

#[async_trait]
impl BuildBackend for RuntimeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn build(
        &self,
        request: &BuildRequest,
        logger: &EventLogger,
    ) -> Result<BuildResponse, BuildError> {
        let rendered = self.template.render(&Self::variables(request));
        let path = request.source_dir.join(GENERATED_DOCKERFILE);
        tokio::fs::write(&path, rendered).await?;

        let image = self
            .ctx
            .namer
            .image_name(&request.service_id, &request.deploy_version)
            .await;
        let result = self.build_rendered(request, logger, &image).await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove generated Dockerfile");
        }
        result?;

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

    #[test]
    fn test_variables_prefer_build_envs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut req = request(tmp.path(), Language::NetCore);
        req.runtime = Some("6.0".into());
        req.build_envs.insert("RUNTIME_VERSION".into(), "7.0".into());

        let vars = RuntimeBackend::variables(&req);
        assert_eq!(vars["SDK_VERSION"], "6.0");
        assert_eq!(vars["RUNTIME_VERSION"], "7.0");
    }

    #[test]
    fn test_netcore_template_defaults() {
        let rendered = Template::new(NETCORE_TEMPLATE).render(&HashMap::new());
        assert!(rendered.starts_with("FROM mcr.microsoft.com/dotnet/sdk:8.0 AS builder"));
        assert!(rendered.contains("EXPOSE 5000"));
        assert!(!rendered.contains("${"));
    }

    #[tokio::test]
    async fn test_builds_and_removes_generated_dockerfile() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = RecordingScheduler::succeeding();
        let backend = RuntimeBackend::netcore(context(scheduler.clone()));
        let (_, log) = logger();

        let response = backend
            .build(&request(tmp.path(), Language::NetCore), &log)
            .await
            .unwrap();

        assert_eq!(response.medium, Medium::Image);
        assert!(!tmp.path().join(GENERATED_DOCKERFILE).exists());
        match &scheduler.jobs()[0].kind {
            BuildJobKind::Image { dockerfile, .. } => assert_eq!(dockerfile, GENERATED_DOCKERFILE),
            other => panic!("unexpected job kind {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generated_dockerfile_removed_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RuntimeBackend::netcore(context(RecordingScheduler::failing("restore failed")));
        let (_, log) = logger();

        let err = backend
            .build(&request(tmp.path(), Language::NetCore), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Job(_)));
        assert!(!tmp.path().join(GENERATED_DOCKERFILE).exists());
    }
}
