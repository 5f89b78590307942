//! `garbage-collection`

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use kiln_core::{Error, EventLogger, Result, Task, TaskType, WorkerTask};

use crate::payload::GcPayload;
use crate::WorkerContext;

/// Removes the slugs, caches and local images of deleted services.
///
/// Every removal is best effort: a leftover is logged and the rest carries on.
pub struct GcWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: GcPayload,
}

impl GcWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
        })
    }
}

async fn remove_dir(path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
            false
        }
    }
}

#[async_trait]
impl WorkerTask for GcWorker {
    fn name(&self) -> &str {
        TaskType::GarbageCollection.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let mut removed = 0usize;
        for service_id in &p.service_ids {
            let slugs = self.ctx.service_slug_dir(&p.tenant_id, service_id);
            let cache = self.ctx.service_cache_dir(&p.tenant_id, service_id);
            let dirs = match (slugs, cache) {
                (Ok(slugs), Ok(cache)) => [slugs, cache],
                (Err(e), _) | (_, Err(e)) => {
                    warn!(
                        tenant_id = %p.tenant_id,
                        service_id = %service_id,
                        error = %e,
                        "Skipping service with an unusable id"
                    );
                    continue;
                }
            };
            for dir in dirs {
                if remove_dir(&dir).await {
                    removed += 1;
                }
            }
        }

        let timeout = self.ctx.registry_timeout();
        for image in &p.images {
            match self.ctx.image_ops.remove(image, &self.logger, timeout).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(image = %image, error = %e, "Failed to remove image"),
            }
        }

        info!(
            tenant_id = %p.tenant_id,
            services = p.service_ids.len(),
            removed,
            "Garbage collection finished"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, err: &Error) {
        warn!(tenant_id = %self.payload.tenant_id, error = %err, "Garbage collection failed");
    }
}
