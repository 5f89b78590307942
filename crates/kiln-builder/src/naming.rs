//! Deterministic image naming.

use std::sync::Arc;

use kiln_core::WorkloadResolver;
use tracing::warn;

/// Names images `{domain}/{namespace}-{app}-{component}:{version}`, falling
/// back to `{domain}/{service_id}:{version}` when the workload name cannot be
/// resolved. Always lower-cased.
#[derive(Clone)]
pub struct ImageNamer {
    domain: String,
    workloads: Arc<dyn WorkloadResolver>,
}

impl ImageNamer {
    pub fn new(domain: impl Into<String>, workloads: Arc<dyn WorkloadResolver>) -> Self {
        Self {
            domain: domain.into().trim_end_matches('/').to_string(),
            workloads,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub async fn image_name(&self, service_id: &str, deploy_version: &str) -> String {
        let repository = match self.workloads.workload_name(service_id).await {
            Ok(Some(workload)) => workload.to_string(),
            Ok(None) => service_id.to_string(),
            Err(e) => {
                warn!(service_id, error = %e, "Workload lookup failed, naming image by service id");
                service_id.to_string()
            }
        };
        self.qualify(&repository, deploy_version)
    }

    /// `{domain}/{repository}:{tag}`, lower-cased.
    pub fn qualify(&self, repository: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.domain, repository, tag).to_lowercase()
    }
}
