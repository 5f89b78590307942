//! `build-from-market-slug`

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use kiln_core::{
    BuildResponse, Error, EventLogger, EventStatus, Medium, Outbound, Result, Task, TaskType,
    VersionKey, WorkerTask,
};

use crate::payload::MarketSlugPayload;
use crate::WorkerContext;

/// Places a slug published on the market where the runtime expects the slug
/// of this deploy version.
pub struct MarketSlugWorker {
    ctx: WorkerContext,
    logger: EventLogger,
    payload: MarketSlugPayload,
}

impl MarketSlugWorker {
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

    async fn download(&self, url: &str, dest: &Path, timeout: Duration) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
        let mut request = client.get(url);
        if let Some(user) = self.payload.user.as_deref().filter(|u| !u.is_empty()) {
            request = request.basic_auth(user, self.payload.password.as_deref());
        }

        let mut response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("download {}: {}", url, e))
            } else {
                Error::ExecutionFailed(format!("download {}: {}", url, e))
            }
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::InvalidInput(format!("slug {} does not exist", url)));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Unauthorized(format!("download {}: {}", url, status)));
        }
        if !status.is_success() {
            return Err(Error::ExecutionFailed(format!("download {}: {}", url, status)));
        }

        let partial = dest.with_extension("tgz.part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| Error::Internal(format!("create {}: {}", partial.display(), e)))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("download {}: {}", url, e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Internal(format!("write {}: {}", partial.display(), e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("write {}: {}", partial.display(), e)))?;
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| Error::Internal(format!("rename {}: {}", partial.display(), e)))?;
        debug!(url, bytes = written, "Downloaded slug");
        Ok(())
    }

    async fn copy_local(&self, src: &Path, dest: &Path) -> Result<()> {
        if !tokio::fs::try_exists(src).await.unwrap_or(false) {
            return Err(Error::InvalidInput(format!(
                "slug {} does not exist",
                src.display()
            )));
        }
        tokio::fs::copy(src, dest)
            .await
            .map_err(|e| Error::Internal(format!("copy {}: {}", src.display(), e)))?;
        Ok(())
    }
}

fn is_remote(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

#[async_trait]
impl WorkerTask for MarketSlugWorker {
    fn name(&self) -> &str {
        TaskType::BuildFromMarketSlug.as_str()
    }

    fn logger(&self) -> &EventLogger {
        &self.logger
    }

    async fn run(&self, timeout: Duration) -> Result<()> {
        let p = &self.payload;
        let dest: PathBuf = self
            .ctx
            .slug_file(&p.tenant_id, &p.service_id, &p.deploy_version)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("create {}: {}", parent.display(), e)))?;
        }

        self.logger.info(
            "Fetching the application package from the market",
            "fetch-slug",
            EventStatus::Starting,
        );
        let fetched = if is_remote(&p.slug_path) {
            self.download(&p.slug_path, &dest, timeout).await
        } else {
            self.copy_local(Path::new(&p.slug_path), &dest).await
        };
        if let Err(e) = fetched {
            self.logger
                .error("Fetching the application package failed", "fetch-slug");
            return Err(e);
        }
        self.logger
            .info("Application package is ready", "fetch-slug", EventStatus::Success);
        info!(service_id = %p.service_id, dest = %dest.display(), "Market slug placed");

        let response = BuildResponse {
            medium: Medium::Slug,
            path: dest.to_string_lossy().into_owned(),
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
    use crate::context::testing::Harness;
    use kiln_core::{FinalStatus, VersionStore};
    use serde_json::json;

    fn task(slug_path: &str) -> Task {
        Task::new(
            "build-from-market-slug",
            json!({
                "event_id": "ev-market",
                "tenant_id": "t1",
                "service_id": "svc1",
                "deploy_version": "v3",
                "slug_path": slug_path,
            }),
        )
    }

    #[test]
    fn test_remote_detection() {
        assert!(is_remote("https://market.example.com/app.tgz"));
        assert!(is_remote("http://market.example.com/app.tgz"));
        assert!(!is_remote("/grdata/market/app.tgz"));
    }

    #[tokio::test]
    async fn test_local_slug_is_copied_into_place() {
        let mut h = Harness::new();
        let src = h.dir.path().join("market.tgz");
        std::fs::write(&src, b"slug bytes").unwrap();

        let worker = MarketSlugWorker::new(&task(src.to_str().unwrap()), &h.ctx).unwrap();
        worker.run(Duration::from_secs(5)).await.unwrap();

        let dest = h.ctx.slug_file("t1", "svc1", "v3").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"slug bytes");
        let record = VersionStore::get(h.store.as_ref(), &VersionKey::new("svc1", "v3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.delivered_type, Some(Medium::Slug));
        assert_eq!(h.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_local_slug_is_invalid_input() {
        let h = Harness::new();
        let worker = MarketSlugWorker::new(&task("/nonexistent/app.tgz"), &h.ctx).unwrap();
        let err = worker.run(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        worker.on_error(&err).await;
        let record = VersionStore::get(h.store.as_ref(), &VersionKey::new("svc1", "v3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.final_status, Some(FinalStatus::Failure));
    }
}
