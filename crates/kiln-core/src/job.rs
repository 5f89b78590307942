//! Build job scheduler trait and job types.
//!
//! Backends do not build artifacts in-process. They describe a build job and
//! hand it to an external scheduler (a cluster job, a local container), then
//! wait for it to reach a terminal state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::image::RegistryAuth;
use crate::{Error, HostAlias, ResourceId, Result};

/// Specification for a build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    /// Unique identifier for this job.
    pub id: ResourceId,
    /// Event the job belongs to, used for labels and log correlation.
    pub event_id: String,
    /// Builder image the job runs.
    pub builder_image: String,
    /// Source tree mounted into the job.
    pub source_dir: PathBuf,
    /// Cache directory mounted into the job.
    pub cache_dir: Option<PathBuf>,
    /// What the job produces.
    pub kind: BuildJobKind,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Static host entries.
    pub host_aliases: Vec<HostAlias>,
    /// Maximum execution time.
    pub timeout: Duration,
}

/// Output of a build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BuildJobKind {
    /// Build an image from a Dockerfile and push it.
    Image {
        /// Dockerfile path relative to the source dir.
        dockerfile: String,
        /// Image reference to push to.
        destination: String,
        build_args: HashMap<String, String>,
        registry: Option<RegistryAuth>,
    },
    /// Package the source into a slug bundle.
    Slug {
        /// Absolute path of the bundle to write.
        output: PathBuf,
        lang: String,
        runtime: Option<String>,
        /// Also publish a runner image holding the slug.
        image: Option<String>,
    },
}

impl BuildJob {
    /// Kubernetes-safe job name.
    pub fn name(&self) -> String {
        let prefix: String = self
            .event_id
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(32)
            .collect();
        if prefix.is_empty() {
            format!("kiln-build-{}", self.id.short())
        } else {
            format!("kiln-{}-{}", prefix, self.id.short())
        }
    }
}

/// Handle to a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    /// The job ID.
    pub id: ResourceId,
    /// Scheduler-specific identifier (e.g., job name, container ID).
    pub scheduler_id: String,
    /// Name of the scheduler running this job.
    pub scheduler_name: String,
}

/// Status of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is waiting to start.
    Pending,
    /// Job is currently running.
    Running { started_at: DateTime<Utc> },
    /// Job completed successfully.
    Succeeded { finished_at: DateTime<Utc> },
    /// Job failed.
    Failed {
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }
}

/// Trait for external build job schedulers.
#[async_trait]
pub trait BuildJobScheduler: Send + Sync {
    /// Name of this scheduler.
    fn name(&self) -> &'static str;

    /// Submit a new job.
    async fn submit(&self, job: BuildJob) -> Result<JobHandle>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to reach a terminal state.
    async fn wait(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Cancel and clean up a job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Submit a job and await its completion within the job's timeout.
    async fn run(&self, job: BuildJob) -> Result<()> {
        let timeout = job.timeout;
        let handle = self.submit(job).await?;
        let status = match tokio::time::timeout(timeout, self.wait(&handle)).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = self.cancel(&handle).await {
                    tracing::warn!(job = %handle.scheduler_id, error = %e, "Failed to cancel timed out job");
                }
                return Err(Error::Timeout(format!(
                    "build job {} exceeded {}s",
                    handle.scheduler_id,
                    timeout.as_secs()
                )));
            }
        };
        match status {
            JobStatus::Succeeded { .. } => Ok(()),
            JobStatus::Failed { message, .. } => Err(Error::ExecutionFailed(format!(
                "build job {} failed: {}",
                handle.scheduler_id, message
            ))),
            _ => Err(Error::Internal(format!(
                "build job {} ended in unexpected state",
                handle.scheduler_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn make_job(event_id: &str, timeout: Duration) -> BuildJob {
        BuildJob {
            id: ResourceId::new(),
            event_id: event_id.to_string(),
            builder_image: "builder:latest".to_string(),
            source_dir: PathBuf::from("/tmp/src"),
            cache_dir: None,
            kind: BuildJobKind::Slug {
                output: PathBuf::from("/tmp/out.tgz"),
                lang: "Python".to_string(),
                runtime: None,
                image: None,
            },
            env: HashMap::new(),
            host_aliases: vec![],
            timeout,
        }
    }

    #[test]
    fn test_job_name_is_dns_safe() {
        let job = make_job("EV_12-ab", Duration::from_secs(1));
        let name = job.name();
        assert!(name.starts_with("kiln-ev12ab-"));
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));

        let anonymous = make_job("", Duration::from_secs(1));
        assert!(anonymous.name().starts_with("kiln-build-"));
    }

    /// Scheduler whose jobs end in a fixed status, or never end.
    struct FixedScheduler {
        outcome: Option<JobStatus>,
        cancelled: Mutex<bool>,
    }

    #[async_trait]
    impl BuildJobScheduler for FixedScheduler {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn submit(&self, job: BuildJob) -> Result<JobHandle> {
            Ok(JobHandle {
                id: job.id,
                scheduler_id: job.name(),
                scheduler_name: self.name().to_string(),
            })
        }

        async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(self.outcome.clone().unwrap_or(JobStatus::Pending))
        }

        async fn wait(&self, _handle: &JobHandle) -> Result<JobStatus> {
            match &self.outcome {
                Some(status) => Ok(status.clone()),
                None => std::future::pending().await,
            }
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
            *self.cancelled.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_maps_failure_to_execution_failed() {
        let scheduler = FixedScheduler {
            outcome: Some(JobStatus::Failed {
                finished_at: Utc::now(),
                exit_code: Some(1),
                message: "compile error".to_string(),
            }),
            cancelled: Mutex::new(false),
        };
        let err = scheduler
            .run(make_job("ev", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(msg) if msg.contains("compile error")));
    }

    #[tokio::test]
    async fn test_run_cancels_on_timeout() {
        let scheduler = FixedScheduler {
            outcome: None,
            cancelled: Mutex::new(false),
        };
        let err = scheduler
            .run(make_job("ev", Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(*scheduler.cancelled.lock().unwrap());
    }

    #[tokio::test]
    async fn test_run_succeeds() {
        let scheduler = FixedScheduler {
            outcome: Some(JobStatus::Succeeded {
                finished_at: Utc::now(),
            }),
            cancelled: Mutex::new(false),
        };
        assert!(scheduler.run(make_job("ev", Duration::from_secs(5))).await.is_ok());
    }
}
