//! Built-in workers, one per statically dispatched task type.

mod check;
mod gc;
mod image;
mod market;
mod plugin;
mod share;
mod source;

use std::sync::Arc;

use kiln_core::{EventLogger, Outbound, Result, Task, TaskType, WorkerTask};
use tracing::warn;

use crate::registry::WorkerFactory;
use crate::WorkerContext;

pub use check::SourceCheckWorker;
pub use gc::GcWorker;
pub use image::ImageBuildWorker;
pub use market::MarketSlugWorker;
pub use plugin::{PluginDockerfileWorker, PluginImageWorker};
pub use share::{ImageShareWorker, SlugShareWorker};
pub use source::SourceBuildWorker;

fn boxed<W: WorkerTask + 'static>(worker: Result<W>) -> Result<Box<dyn WorkerTask>> {
    worker.map(|w| Box::new(w) as Box<dyn WorkerTask>)
}

/// Factory of the built-in worker for `task_type`.
pub(crate) fn factory(task_type: TaskType) -> Arc<dyn WorkerFactory> {
    match task_type {
        TaskType::BuildFromSourceCode => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(SourceBuildWorker::new(t, ctx))
        }),
        TaskType::BuildFromImage => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(ImageBuildWorker::new(t, ctx))
        }),
        TaskType::BuildFromMarketSlug => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(MarketSlugWorker::new(t, ctx))
        }),
        TaskType::ServiceSourceCheck => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(SourceCheckWorker::new(t, ctx))
        }),
        TaskType::PluginImageBuild => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(PluginImageWorker::new(t, ctx))
        }),
        TaskType::PluginDockerfileBuild => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(PluginDockerfileWorker::new(t, ctx))
        }),
        TaskType::ImageShare => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(ImageShareWorker::new(t, ctx))
        }),
        TaskType::SlugShare => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(SlugShareWorker::new(t, ctx))
        }),
        TaskType::GarbageCollection => Arc::new(|t: &Task, ctx: &WorkerContext| {
            boxed(GcWorker::new(t, ctx))
        }),
    }
}

/// Shutdown notice shared by the built-in workers.
fn interrupted(logger: &EventLogger) -> Result<()> {
    logger.warn(
        "The task was interrupted by a node shutdown and will run again",
        "shutdown",
    );
    Ok(())
}

/// Publish an outbound message. A lost notification never fails the task.
async fn publish(ctx: &WorkerContext, message: Outbound) {
    if let Err(e) = ctx.notifier.publish(message).await {
        warn!(error = %e, "Failed to publish notification");
    }
}
