//! `service-source-check`

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use kiln_core::{
    Error, EventLogger, EventStatus, Language, Outbound, Result, Task, TaskType, WorkerTask,
};
use kiln_source::fetcher::Credentials;
use kiln_source::{FetchOptions, RepositoryInfo, detect_language};

use crate::payload::{CheckSource, SourceCheckPayload};
use crate::WorkerContext;

/// Verifies a source is reachable and reports its language.
///
/// A checked repository stays in its cache root so the build that follows
/// pulls incrementally.
pub struct SourceCheckWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: SourceCheckPayload,
    failure: Mutex<Option<&'static str>>,
}

impl SourceCheckWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
            failure: Mutex::new(None),
        })
    }

    fn remember(&self, message: &'static str) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(message);
        }
    }

    async fn check_source(&self) -> Result<Language> {
        let p = &self.payload;
        let repo = RepositoryInfo::resolve(
            &p.source_body,
            &p.branch,
            &p.server_type,
            &p.tenant_id,
            &p.service_id,
            &self.ctx.config.paths.source_dir,
        )
        .inspect_err(|e| self.remember(e.user_message()))?;

        let _workspace = self.ctx.fetcher.lock_workspace(&repo).await;
        let opts = FetchOptions {
            tenant_id: p.tenant_id.clone(),
            credentials: Credentials::new(p.user.as_deref(), p.password.as_deref()),
            no_cache: false,
        };
        self.ctx
            .fetcher
            .fetch(&repo, &opts)
            .await
            .inspect_err(|e| self.remember(e.user_message()))?;

        let lang = detect_language(&repo.build_dir())
            .await
            .inspect_err(|e| self.remember(e.user_message()))?;
        Ok(lang)
    }

    async fn check_image(&self, timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let auth = self
            .ctx
            .pull_auth(&p.source_body, p.user.as_deref(), p.password.as_deref());
        self.ctx
            .image_ops
            .pull(&p.source_body, auth.as_ref(), &self.logger, timeout)
            .await
            .inspect_err(|_| self.remember("The image could not be pulled"))
    }
}

#[async_trait]
impl WorkerTask for SourceCheckWorker {
    fn name(&self) -> &str {
        TaskType::ServiceSourceCheck.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        self.logger
            .info("Checking the service source", "check", EventStatus::Starting);
        let language = match p.source_type {
            CheckSource::SourceCode => {
                let lang = self.check_source().await?;
                self.logger.info(
                    format!("Detected language {}", lang),
                    "check",
                    EventStatus::Success,
                );
                Some(lang.to_string())
            }
            CheckSource::Image => {
                self.check_image(self.ctx.registry_timeout()).await?;
                self.logger
                    .info("The image is available", "check", EventStatus::Success);
                None
            }
        };

        super::publish(
            &self.ctx,
            Outbound::CheckResult {
                event_id: p.event_id.clone(),
                tenant_id: p.tenant_id.clone(),
                check_id: p.check_id.clone(),
                success: true,
                language,
                message: String::new(),
            },
        )
        .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        super::interrupted(&self.logger)
    }

    async fn on_error(&self, _err: &Error) {
        let p = &self.payload;
        let message = self
            .failure
            .lock()
            .ok()
            .and_then(|f| *f)
            .unwrap_or("The source check failed");
        self.logger.error(message, "check");
        super::publish(
            &self.ctx,
            Outbound::CheckResult {
                event_id: p.event_id.clone(),
                tenant_id: p.tenant_id.clone(),
                check_id: p.check_id.clone(),
                success: false,
                language: None,
                message: message.to_string(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{FakeImageOps, FakeRunner, Harness, git_script};
    use crate::notify::Delivery;
    use crate::{TaskEngine, WorkerRegistry};
    use kiln_source::CommandOutput;
    use serde_json::json;

    fn task(source_type: &str, body: &str) -> Task {
        Task::new(
            "service-source-check",
            json!({
                "event_id": "ev-check",
                "tenant_id": "t1",
                "check_id": "chk1",
                "service_id": "svc1",
                "source_type": source_type,
                "source_body": body,
                "branch": "main",
            }),
        )
    }

    fn check_result(deliveries: Vec<Delivery>) -> Outbound {
        match deliveries.as_slice() {
            [Delivery::Publish { message }] => message.clone(),
            other => panic!("expected one published message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_source_check_reports_language() {
        let mut h = Harness::build(
            FakeImageOps::default(),
            FakeRunner::new(git_script(&["Dockerfile"])),
            |_| {},
        );
        let engine = TaskEngine::new(h.ctx.clone(), WorkerRegistry::builtin(&h.ctx.config));
        engine
            .submit(task("source-code", "https://git.example.com/app.git"))
            .await;
        engine.wait_idle().await;

        match check_result(h.drain()) {
            Outbound::CheckResult {
                success, language, ..
            } => {
                assert!(success);
                assert_eq!(language.as_deref(), Some("dockerfile"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_check_publishes_reason_once() {
        let mut h = Harness::build(
            FakeImageOps::default(),
            FakeRunner::new(|_| CommandOutput::failed(128, "remote: Repository not found.")),
            |_| {},
        );
        let engine = TaskEngine::new(h.ctx.clone(), WorkerRegistry::builtin(&h.ctx.config));
        engine
            .submit(task("source-code", "https://git.example.com/gone.git"))
            .await;
        engine.wait_idle().await;

        match check_result(h.drain()) {
            Outbound::CheckResult {
                success, message, ..
            } => {
                assert!(!success);
                assert_eq!(message, "The repository does not exist");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.runner.clones(), 1);
    }

    #[tokio::test]
    async fn test_image_check_pulls() {
        let mut h = Harness::new();
        let worker =
            SourceCheckWorker::new(&task("image", "docker.io/library/redis:7"), &h.ctx).unwrap();
        worker.run(Duration::from_secs(5)).await.unwrap();

        assert_eq!(h.image_ops.calls(), vec!["pull docker.io/library/redis:7"]);
        assert!(matches!(
            check_result(h.drain()),
            Outbound::CheckResult { success: true, language: None, .. }
        ));
    }
}
