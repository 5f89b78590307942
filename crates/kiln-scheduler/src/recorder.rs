//! Persists build outcomes against version records.

use std::sync::Arc;

use tracing::{info, warn};

use kiln_core::{BuildResponse, Commit, Result, VersionKey, VersionStore, VersionUpdate};

#[derive(Clone)]
pub struct VersionRecorder {
    store: Arc<dyn VersionStore>,
}

impl VersionRecorder {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self { store }
    }

    /// Record a delivered artifact and terminal success.
    pub async fn record_success(
        &self,
        key: &VersionKey,
        event_id: &str,
        response: &BuildResponse,
        commit: Option<&Commit>,
        branch: &str,
    ) -> Result<()> {
        let update = VersionUpdate::success(event_id, response)
            .with_commit(commit)
            .with_branch(branch);
        let record = self.store.upsert(key, &update).await?;
        info!(
            service_id = %key.service_id,
            deploy_version = %key.deploy_version,
            medium = response.medium.as_str(),
            status = ?record.final_status,
            "Recorded build success"
        );
        Ok(())
    }

    /// Record a terminal failure with whatever metadata was gathered.
    /// Persistence errors are logged, never raised: the task is already
    /// failing.
    pub async fn record_failure(
        &self,
        key: &VersionKey,
        event_id: &str,
        commit: Option<&Commit>,
        branch: &str,
    ) {
        let update = VersionUpdate::failure(event_id)
            .with_commit(commit)
            .with_branch(branch);
        match self.store.upsert(key, &update).await {
            Ok(_) => info!(
                service_id = %key.service_id,
                deploy_version = %key.deploy_version,
                "Recorded build failure"
            ),
            Err(e) => warn!(
                service_id = %key.service_id,
                deploy_version = %key.deploy_version,
                error = %e,
                "Failed to record build failure"
            ),
        }
    }
}
