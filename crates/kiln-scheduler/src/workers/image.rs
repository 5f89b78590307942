//! `build-from-image`

use async_trait::async_trait;
use std::time::Duration;

use kiln_core::{
    BuildResponse, Error, EventLogger, EventStatus, Medium, Outbound, Result, Task, TaskType,
    VersionKey, WorkerTask,
};

use crate::payload::ImageBuildPayload;
use crate::WorkerContext;

/// Pulls a user image, re-tags it under the platform registry and pushes it.
pub struct ImageBuildWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: ImageBuildPayload,
}

impl ImageBuildWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
        })
    }

    fn key(&self) -> VersionKey {
        VersionKey::new(&self.payload.service_id, &self.payload.deploy_version)
    }
}

#[async_trait]
impl WorkerTask for ImageBuildWorker {
    fn name(&self) -> &str {
        TaskType::BuildFromImage.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let ops = &self.ctx.image_ops;
        let timeout = self.ctx.registry_timeout();

        let source_auth = self
            .ctx
            .pull_auth(&p.image, p.user.as_deref(), p.password.as_deref());
        if let Err(e) = ops.pull(&p.image, source_auth.as_ref(), &self.logger, timeout).await {
            self.logger.error(format!("Pulling image {} failed", p.image), "pull-image");
            return Err(e);
        }

        let target = self
            .ctx
            .build
            .namer
            .image_name(&p.service_id, &p.deploy_version)
            .await;
        ops.tag(&p.image, &target, &self.logger, timeout).await?;
        if let Err(e) = ops
            .push(&target, self.ctx.platform_auth(), &self.logger, timeout)
            .await
        {
            self.logger
                .error(format!("Pushing image {} failed", target), "push-image");
            return Err(e);
        }
        self.logger.info(
            format!("Image {} is ready", target),
            "build-image",
            EventStatus::Success,
        );

        let response = BuildResponse {
            medium: Medium::Image,
            path: target,
        };
        self.ctx
            .recorder
            .record_success(&self.key(), &p.event_id, &response, None, "")
            .await?;
        super::publish(
            &self.ctx,
            Outbound::Upgrade {
                tenant_id: p.tenant_id.clone(),
                service_id: p.service_id.clone(),
                event_id: p.event_id.clone(),
                deploy_version: p.deploy_version.clone(),
                action: p.action.clone(),
            },
        )
        .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        super::interrupted(&self.logger)
    }

    async fn on_error(&self, _err: &Error) {
        self.ctx
            .recorder
            .record_failure(&self.key(), &self.payload.event_id, None, "")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{FakeImageOps, FakeRunner, Harness, git_script};
    use crate::notify::Delivery;
    use crate::{TaskEngine, WorkerRegistry};
    use kiln_core::{FinalStatus, VersionStore};
    use serde_json::json;

    fn task() -> Task {
        Task::new(
            "build-from-image",
            json!({
                "event_id": "ev-img",
                "tenant_id": "t1",
                "service_id": "svc1",
                "deploy_version": "v2",
                "image": "docker.io/library/nginx:1.25"
            }),
        )
    }

    fn engine(h: &Harness) -> TaskEngine {
        TaskEngine::new(h.ctx.clone(), WorkerRegistry::builtin(&h.ctx.config))
    }

    #[tokio::test]
    async fn test_image_build_records_and_notifies() {
        let mut h = Harness::new();
        let engine = engine(&h);
        engine.submit(task()).await;
        engine.wait_idle().await;

        assert_eq!(
            h.image_ops.calls(),
            vec![
                "pull docker.io/library/nginx:1.25",
                "tag docker.io/library/nginx:1.25 goodrain.me/svc1:v2",
                "push goodrain.me/svc1:v2",
            ]
        );
        let record = VersionStore::get(h.store.as_ref(), &VersionKey::new("svc1", "v2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.final_status, Some(FinalStatus::Success));
        assert_eq!(record.delivered_type, Some(Medium::Image));
        assert!(matches!(
            h.drain().as_slice(),
            [Delivery::Publish {
                message: Outbound::Upgrade { .. }
            }]
        ));
    }

    #[tokio::test]
    async fn test_permanently_failing_image_build_runs_twice() {
        let h = Harness::build(
            FakeImageOps::failing(u32::MAX),
            FakeRunner::new(git_script(&[])),
            |_| {},
        );
        let engine = engine(&h);
        engine.submit(task()).await;
        engine.wait_idle().await;

        assert_eq!(h.image_ops.count("pull"), 2);
        let record = VersionStore::get(h.store.as_ref(), &VersionKey::new("svc1", "v2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.final_status, Some(FinalStatus::Failure));
        assert_eq!(h.events.terminal_lines("ev-img").len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_second_attempt() {
        let h = Harness::build(FakeImageOps::failing(1), FakeRunner::new(git_script(&[])), |_| {});
        let engine = engine(&h);
        engine.submit(task()).await;
        engine.wait_idle().await;

        assert_eq!(h.image_ops.count("pull"), 2);
        assert_eq!(engine.stats().succeeded, 1);
    }
}
