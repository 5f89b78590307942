//! `image-share` and `slug-share`

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_core::{
    Error, EventLogger, EventStatus, Outbound, RegistryAuth, Result, Task, TaskType, WorkerTask,
};

use crate::payload::{ImageSharePayload, SlugSharePayload};
use crate::WorkerContext;

async fn publish_failure(ctx: &WorkerContext, event_id: &str, share_id: &str, err: &Error) {
    super::publish(
        ctx,
        Outbound::ShareResult {
            event_id: event_id.to_string(),
            share_id: share_id.to_string(),
            success: false,
            location: None,
            message: err.to_string(),
        },
    )
    .await;
}

/// Copies a platform image to an external registry.
pub struct ImageShareWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: ImageSharePayload,
}

impl ImageShareWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
        })
    }
}

#[async_trait]
impl WorkerTask for ImageShareWorker {
    fn name(&self) -> &str {
        TaskType::ImageShare.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let ops = &self.ctx.image_ops;
        let timeout = self.ctx.registry_timeout();

        let pull_auth = self.ctx.pull_auth(&p.image, None, None);
        ops.pull(&p.image, pull_auth.as_ref(), &self.logger, timeout)
            .await?;
        ops.tag(&p.image, &p.target_image, &self.logger, timeout)
            .await?;
        let push_auth = RegistryAuth::for_image(
            p.target_user.as_deref(),
            p.target_password.as_deref(),
            &p.target_image,
        );
        ops.push(&p.target_image, push_auth.as_ref(), &self.logger, timeout)
            .await?;
        self.logger.info(
            format!("Image shared as {}", p.target_image),
            "share-image",
            EventStatus::Success,
        );

        super::publish(
            &self.ctx,
            Outbound::ShareResult {
                event_id: p.event_id.clone(),
                share_id: p.share_id.clone(),
                success: true,
                location: Some(p.target_image.clone()),
                message: String::new(),
            },
        )
        .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        super::interrupted(&self.logger)
    }

    async fn on_error(&self, err: &Error) {
        publish_failure(&self.ctx, &self.payload.event_id, &self.payload.share_id, err).await;
    }
}

/// Copies a slug package into a shared directory.
pub struct SlugShareWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: SlugSharePayload,
}

impl SlugShareWorker {
    pub fn new(task: &Task, ctx: &WorkerContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            logger: ctx.logger(&task.event_id()),
            payload: task.payload()?,
        })
    }

    fn destination(&self) -> Result<PathBuf> {
        let src = Path::new(&self.payload.slug_path);
        let file_name = src.file_name().ok_or_else(|| {
            Error::InvalidInput(format!("slug path {} has no file name", src.display()))
        })?;
        Ok(Path::new(&self.payload.target_dir).join(file_name))
    }
}

#[async_trait]
impl WorkerTask for SlugShareWorker {
    fn name(&self) -> &str {
        TaskType::SlugShare.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, _timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let src = Path::new(&p.slug_path);
        if !tokio::fs::try_exists(src).await.unwrap_or(false) {
            self.logger.error("The slug package does not exist", "share-slug");
            return Err(Error::InvalidInput(format!("slug {} does not exist", p.slug_path)));
        }
        let dest = self.destination()?;
        tokio::fs::create_dir_all(&p.target_dir)
            .await
            .map_err(|e| Error::Internal(format!("create {}: {}", p.target_dir, e)))?;
        tokio::fs::copy(src, &dest)
            .await
            .map_err(|e| Error::Internal(format!("copy {}: {}", p.slug_path, e)))?;
        let location = dest.to_string_lossy().into_owned();
        self.logger.info(
            format!("Slug shared to {}", location),
            "share-slug",
            EventStatus::Success,
        );

        super::publish(
            &self.ctx,
            Outbound::ShareResult {
                event_id: p.event_id.clone(),
                share_id: p.share_id.clone(),
                success: true,
                location: Some(location),
                message: String::new(),
            },
        )
        .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        super::interrupted(&self.logger)
    }

    async fn on_error(&self, err: &Error) {
        publish_failure(&self.ctx, &self.payload.event_id, &self.payload.share_id, err).await;
    }
}
