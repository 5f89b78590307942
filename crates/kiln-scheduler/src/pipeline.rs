//! The source build pipeline.
//!
//! Resolve the repository, fetch it into its cache root, optionally detect
//! the language again, run the backend registered for the language, and
//! remove the working tree. Every stage logs a short user-facing line before
//! its error propagates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

use kiln_core::{
    BuildRequest, BuildResponse, Commit, EventLogger, EventStatus, Language, Result,
};
use kiln_source::fetcher::Credentials;
use kiln_source::{FetchOptions, RepositoryInfo, VcsKind, detect_language};

use crate::payload::SourceBuildPayload;
use crate::WorkerContext;

/// Result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub response: BuildResponse,
    pub commit: Option<Commit>,
    pub lang: Language,
    pub backend: &'static str,
}

/// One source build. Keeps the commit it fetched so a failure can still be
/// recorded with it.
pub struct SourcePipeline {
    payload: SourceBuildPayload,
    commit: Mutex<Option<Commit>>,
}

impl SourcePipeline {
    pub fn new(payload: SourceBuildPayload) -> Self {
        Self {
            payload,
            commit: Mutex::new(None),
        }
    }

    pub fn payload(&self) -> &SourceBuildPayload {
        &self.payload
    }

    /// Commit of the last successful fetch.
    pub fn commit(&self) -> Option<Commit> {
        self.commit.lock().ok().and_then(|c| c.clone())
    }

    pub async fn run(&self, ctx: &WorkerContext, logger: &EventLogger) -> Result<PipelineOutput> {
        let p = &self.payload;
        let cache_dir = match ctx.service_cache_dir(&p.tenant_id, &p.service_id) {
            Ok(dir) => dir,
            Err(e) => {
                logger.error("The tenant or service id is invalid", "resolve");
                return Err(e);
            }
        };
        let repo = match RepositoryInfo::resolve(
            &p.repo_url,
            &p.branch,
            &p.server_type,
            &p.tenant_id,
            &p.service_id,
            &ctx.config.paths.source_dir,
        ) {
            Ok(repo) => repo,
            Err(e) => {
                logger.error(e.user_message(), "resolve");
                return Err(e.into());
            }
        };

        let _workspace = ctx.fetcher.lock_workspace(&repo).await;
        let result = self.build(ctx, logger, &repo, cache_dir).await;
        ctx.fetcher.cleanup(&repo).await;
        result
    }

    async fn build(
        &self,
        ctx: &WorkerContext,
        logger: &EventLogger,
        repo: &RepositoryInfo,
        cache_dir: PathBuf,
    ) -> Result<PipelineOutput> {
        let p = &self.payload;
        logger.info(
            format!("Fetching source code, branch {}", repo.branch),
            "fetch",
            EventStatus::Starting,
        );
        let opts = FetchOptions {
            tenant_id: p.tenant_id.clone(),
            credentials: Credentials::new(p.user.as_deref(), p.password.as_deref()),
            no_cache: p.envs.contains_key("NO_CACHE"),
        };
        let commit = match ctx.fetcher.fetch(repo, &opts).await {
            Ok(commit) => commit,
            Err(e) => {
                logger.error(e.user_message(), "fetch");
                return Err(e.into());
            }
        };
        match &commit {
            Some(c) => logger.info(
                format!("Code version {} by {}: {}", c.short_hash(), c.author, c.message),
                "fetch",
                EventStatus::Success,
            ),
            None => logger.info("Source package extracted", "fetch", EventStatus::Success),
        }
        if let Ok(mut gathered) = self.commit.lock() {
            *gathered = commit.clone();
        }

        let build_dir = repo.build_dir();
        let mut lang = Language::parse(&p.lang);
        if p.reparse {
            match detect_language(&build_dir).await {
                Ok(detected) => {
                    logger.info(
                        format!("Detected language {}", detected),
                        "detect",
                        EventStatus::Success,
                    );
                    lang = detected;
                }
                Err(e) => {
                    warn!(error = %e, "Language detection failed, keeping declared language");
                    logger.warn(
                        "Language detection failed, building with the declared language",
                        "detect",
                    );
                }
            }
        }

        let backend = match repo.kind {
            VcsKind::Oss => ctx.backends.fallback(),
            VcsKind::Git | VcsKind::Svn => ctx.backends.lookup(&lang),
        };

        let host_aliases = match ctx.host_aliases.host_aliases().await {
            Ok(aliases) => aliases,
            Err(e) => {
                warn!(error = %e, "Host alias lookup failed, building without them");
                Vec::new()
            }
        };

        let mut build_envs: HashMap<String, String> = p.configs.clone();
        build_envs.extend(p.envs.iter().map(|(k, v)| (k.clone(), v.clone())));

        let request = BuildRequest {
            event_id: p.event_id.clone(),
            tenant_id: p.tenant_id.clone(),
            service_id: p.service_id.clone(),
            service_alias: p.service_alias.clone(),
            deploy_version: p.deploy_version.clone(),
            lang: lang.clone(),
            runtime: p.runtime.clone(),
            source_dir: build_dir,
            cache_dir,
            slug_dir: ctx.config.paths.slug_dir.clone(),
            branch: repo.branch.name().to_string(),
            commit: commit.clone(),
            build_envs,
            medium_hint: p.medium,
            host_aliases,
        };

        info!(
            event_id = %p.event_id,
            service_id = %p.service_id,
            lang = %lang,
            backend = backend.name(),
            "Invoking build backend"
        );
        let response = match backend.build(&request, logger).await {
            Ok(response) => response,
            Err(e) => {
                logger.error(e.user_message(), "build");
                return Err(e.into());
            }
        };

        Ok(PipelineOutput {
            response,
            commit,
            lang,
            backend: backend.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{FakeRunner, Harness, git_script};
    use kiln_core::Medium;
    use kiln_core::job::BuildJobKind;
    use kiln_source::CommandOutput;
    use serde_json::json;

    fn payload(lang: &str, repo_url: &str) -> SourceBuildPayload {
        serde_json::from_value(json!({
            "event_id": "ev-1",
            "tenant_id": "tenant1",
            "service_id": "svc1",
            "deploy_version": "20240101",
            "lang": lang,
            "repo_url": repo_url,
            "branch": "main",
        }))
        .unwrap()
    }

    fn harness(files: &'static [&'static str]) -> Harness {
        Harness::build(Default::default(), FakeRunner::new(git_script(files)), |_| {})
    }

    #[tokio::test]
    async fn test_dockerfile_source_builds_an_image() {
        let h = harness(&["Dockerfile"]);
        let pipeline = SourcePipeline::new(payload("dockerfile", "https://git.example.com/app.git"));
        let logger = h.ctx.logger("ev-1");

        let out = pipeline.run(&h.ctx, &logger).await.unwrap();
        assert_eq!(out.backend, "dockerfile");
        assert_eq!(out.response.medium, Medium::Image);
        assert_eq!(out.response.path, "goodrain.me/svc1:20240101");
        assert_eq!(out.commit.unwrap().short_hash(), "0123456");
        assert_eq!(h.jobs.jobs().len(), 1);
        assert!(matches!(h.jobs.jobs()[0].kind, BuildJobKind::Image { .. }));
    }

    #[tokio::test]
    async fn test_unknown_language_falls_back_to_slug() {
        let h = harness(&["main.rs"]);
        let pipeline = SourcePipeline::new(payload("", "https://git.example.com/app.git"));
        let logger = h.ctx.logger("ev-1");

        let out = pipeline.run(&h.ctx, &logger).await.unwrap();
        assert_eq!(out.backend, "slug");
        assert_eq!(out.response.medium, Medium::Slug);
        assert!(out.response.path.ends_with("tenant1/slug/svc1/20240101.tgz"));
    }

    #[tokio::test]
    async fn test_reparse_overrides_declared_language() {
        let h = harness(&["Dockerfile"]);
        let mut p = payload("python", "https://git.example.com/app.git");
        p.reparse = true;
        let pipeline = SourcePipeline::new(p);

        let out = pipeline.run(&h.ctx, &h.ctx.logger("ev-1")).await.unwrap();
        assert_eq!(out.lang, Language::Dockerfile);
        assert_eq!(out.backend, "dockerfile");
    }

    #[tokio::test]
    async fn test_working_tree_is_removed_after_build() {
        let h = harness(&["Dockerfile"]);
        let pipeline = SourcePipeline::new(payload("dockerfile", "https://git.example.com/app.git"));
        pipeline.run(&h.ctx, &h.ctx.logger("ev-1")).await.unwrap();

        let tenant_root = h.dir.path().join("source").join("build").join("tenant1");
        let leftovers = std::fs::read_dir(&tenant_root)
            .map(|d| d.count())
            .unwrap_or_default();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_missing_dockerfile_fails_with_user_message() {
        let h = harness(&["app.py"]);
        let pipeline = SourcePipeline::new(payload("dockerfile", "https://git.example.com/app.git"));

        let err = pipeline.run(&h.ctx, &h.ctx.logger("ev-1")).await.unwrap_err();
        assert!(!err.is_retryable());
        // The fetched commit survives for the failure record.
        assert!(pipeline.commit().is_some());
        let lines = h.events.lines_for("ev-1");
        assert!(lines.iter().any(|l| l.step == "build" && l.status == EventStatus::Failure));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported_before_propagating() {
        let h = Harness::build(
            Default::default(),
            FakeRunner::new(|_| CommandOutput::failed(128, "remote: Repository not found.")),
            |_| {},
        );
        let pipeline = SourcePipeline::new(payload("dockerfile", "https://git.example.com/gone.git"));

        let err = pipeline.run(&h.ctx, &h.ctx.logger("ev-1")).await.unwrap_err();
        assert!(matches!(err, kiln_core::Error::InvalidInput(_)));
        let lines = h.events.lines_for("ev-1");
        let fetch = lines.iter().find(|l| l.step == "fetch" && l.status == EventStatus::Failure);
        assert_eq!(fetch.unwrap().message, "The repository does not exist");
        assert!(pipeline.commit().is_none());
    }

    #[tokio::test]
    async fn test_service_id_escaping_the_cache_is_rejected_before_fetch() {
        let h = harness(&["Dockerfile"]);
        let mut p = payload("dockerfile", "https://git.example.com/app.git");
        p.service_id = "../other".into();
        let pipeline = SourcePipeline::new(p);

        let err = pipeline.run(&h.ctx, &h.ctx.logger("ev-1")).await.unwrap_err();
        assert!(matches!(err, kiln_core::Error::InvalidInput(_)));
        assert_eq!(h.runner.clones(), 0);
        assert!(h.jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_ssh_clone_falls_back_to_shared_key() {
        let h = Harness::build(
            Default::default(),
            FakeRunner::new(|spec: &kiln_source::CommandSpec| {
                let ssh = spec
                    .env
                    .iter()
                    .find(|(k, _)| k == "GIT_SSH_COMMAND")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                if spec.has_arg("clone") && ssh.contains("builder_rsa_tenant1") {
                    CommandOutput::failed(128, "git@git.example.com: Permission denied (publickey).")
                } else {
                    git_script(&["Dockerfile"])(spec)
                }
            }),
            |_| {},
        );
        let keys = h.dir.path().join("ssh");
        std::fs::create_dir_all(&keys).unwrap();
        std::fs::write(keys.join("builder_rsa_tenant1"), "tenant key").unwrap();
        std::fs::write(keys.join("builder_rsa"), "shared key").unwrap();

        let pipeline = SourcePipeline::new(payload("dockerfile", "git@git.example.com:org/app.git"));
        let out = pipeline.run(&h.ctx, &h.ctx.logger("ev-1")).await.unwrap();

        assert_eq!(h.runner.clones(), 2);
        assert_eq!(out.commit.unwrap().hash, "0123456789abcdef");
        assert_eq!(out.response.medium, Medium::Image);
    }
}
