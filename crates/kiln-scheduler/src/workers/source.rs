//! `build-from-source-code`

use async_trait::async_trait;
use std::time::Duration;

use kiln_core::{
    Error, EventLogger, EventStatus, Outbound, Result, Task, TaskType, VersionKey, WorkerTask,
};

use crate::pipeline::SourcePipeline;
use crate::WorkerContext;

pub struct SourceBuildWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    pipeline: SourcePipeline,
}

impl SourceBuildWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        let payload = task.payload()?;
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            pipeline: SourcePipeline::new(payload),
        })
    }

    fn key(&self) -> VersionKey {
        let p = self.pipeline.payload();
        VersionKey::new(&p.service_id, &p.deploy_version)
    }
}

#[async_trait]
impl WorkerTask for SourceBuildWorker {
    fn name(&self) -> &str {
        TaskType::BuildFromSourceCode.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = self.pipeline.payload();
        self.logger
            .info("Starting source code build", "build", EventStatus::Starting);
        let out = self.pipeline.run(&self.ctx, &self.logger).await?;

        self.ctx
            .recorder
            .record_success(
                &self.key(),
                &p.event_id,
                &out.response,
                out.commit.as_ref(),
                &p.branch,
            )
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
        let p = self.pipeline.payload();
        self.ctx
            .recorder
            .record_failure(
                &self.key(),
                &p.event_id,
                self.pipeline.commit().as_ref(),
                &p.branch,
            )
            .await;
    }
}
