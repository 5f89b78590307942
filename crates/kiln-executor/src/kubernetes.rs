//! Kubernetes job scheduler and endpoint-based host alias resolver.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Endpoints;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use kiln_core::job::{BuildJob, BuildJobScheduler, JobHandle, JobStatus};
use kiln_core::{Error, HostAlias, HostAliasResolver, Result};

use crate::spec::ContainerSpec;

const MANAGED_BY: &str = "kiln";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Finished jobs are garbage collected by the cluster after this long.
const TTL_AFTER_FINISHED_SECS: i64 = 60;

/// Runs build jobs as Kubernetes batch Jobs.
pub struct KubernetesJobScheduler {
    client: Client,
    namespace: String,
    poll_interval: Duration,
}

impl KubernetesJobScheduler {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl BuildJobScheduler for KubernetesJobScheduler {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn submit(&self, job: BuildJob) -> Result<JobHandle> {
        let name = job.name();
        let manifest = job_manifest(&job, &self.namespace)?;
        info!(job = %name, namespace = %self.namespace, image = %job.builder_image, "Creating build job");
        self.jobs()
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| kube_error("create job", e))?;
        Ok(JobHandle {
            id: job.id,
            scheduler_id: name,
            scheduler_name: self.name().to_string(),
        })
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let job = self
            .jobs()
            .get_opt(&handle.scheduler_id)
            .await
            .map_err(|e| kube_error("get job", e))?
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.scheduler_id)))?;
        Ok(job_status(&job))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobStatus> {
        loop {
            let status = self.status(handle).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            debug!(job = %handle.scheduler_id, ?status, "Build job not finished");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        match self
            .jobs()
            .delete(&handle.scheduler_id, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(kube_error("delete job", e)),
        }
    }
}

/// The batch Job running `job` in `namespace`.
pub fn job_manifest(job: &BuildJob, namespace: &str) -> Result<Job> {
    let spec = ContainerSpec::from_job(job);

    let volumes: Vec<_> = spec
        .mounts
        .iter()
        .enumerate()
        .map(|(i, m)| {
            json!({
                "name": format!("vol-{}", i),
                "hostPath": { "path": m.host.to_string_lossy(), "type": "DirectoryOrCreate" },
            })
        })
        .collect();
    let volume_mounts: Vec<_> = spec
        .mounts
        .iter()
        .enumerate()
        .map(|(i, m)| {
            json!({
                "name": format!("vol-{}", i),
                "mountPath": m.container,
                "readOnly": m.read_only,
            })
        })
        .collect();
    let env: Vec<_> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let host_aliases: Vec<_> = spec
        .host_aliases
        .iter()
        .map(|a| json!({ "ip": a.ip, "hostnames": a.hostnames }))
        .collect();

    let mut container = json!({
        "name": "build",
        "image": spec.image,
        "args": spec.args,
        "env": env,
        "volumeMounts": volume_mounts,
    });
    if !spec.command.is_empty() {
        container["command"] = json!(spec.command);
    }
    if let Some(dir) = &spec.working_dir {
        container["workingDir"] = json!(dir);
    }

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job.name(),
            "namespace": namespace,
            "labels": {
                "app.kubernetes.io/managed-by": MANAGED_BY,
                "kiln/job-id": job.id.short(),
            },
            "annotations": { "kiln/event-id": job.event_id },
        },
        "spec": {
            "backoffLimit": 0,
            "ttlSecondsAfterFinished": TTL_AFTER_FINISHED_SECS,
            "activeDeadlineSeconds": job.timeout.as_secs().max(1),
            "template": {
                "metadata": { "labels": { "app.kubernetes.io/managed-by": MANAGED_BY } },
                "spec": {
                    "restartPolicy": "Never",
                    "hostAliases": host_aliases,
                    "containers": [container],
                    "volumes": volumes,
                },
            },
        },
    });

    serde_json::from_value(manifest).map_err(|e| Error::Internal(format!("invalid job manifest: {}", e)))
}

/// Map a Job's status block onto a scheduler status.
pub fn job_status(job: &Job) -> JobStatus {
    let Some(status) = job.status.as_ref() else {
        return JobStatus::Pending;
    };

    if status.succeeded.unwrap_or(0) > 0 {
        return JobStatus::Succeeded {
            finished_at: status.completion_time.as_ref().map(|t| t.0).unwrap_or_else(Utc::now),
        };
    }

    let failed_condition = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "Failed" && c.status == "True");
    if status.failed.unwrap_or(0) > 0 || failed_condition.is_some() {
        let message = failed_condition
            .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
            .unwrap_or_else(|| "build job failed".to_string());
        return JobStatus::Failed {
            finished_at: failed_condition
                .and_then(|c| c.last_transition_time.as_ref())
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
            exit_code: None,
            message,
        };
    }

    if status.active.unwrap_or(0) > 0 {
        return JobStatus::Running {
            started_at: status.start_time.as_ref().map(|t| t.0).unwrap_or_else(Utc::now),
        };
    }
    JobStatus::Pending
}

fn kube_error(action: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(response) if response.code == 404 => {
            Error::NotFound(format!("{}: {}", action, response.message))
        }
        kube::Error::Api(response) if response.code == 403 => {
            Error::Forbidden(format!("{}: {}", action, response.message))
        }
        e => Error::ExecutionFailed(format!("{}: {}", action, e)),
    }
}

/// Resolves host aliases from the endpoints of the source-mirror service:
/// every ready endpoint IP maps to the configured mirror host names.
pub struct EndpointHostAliasResolver {
    client: Client,
    service: String,
    namespace: String,
    hosts: Vec<String>,
}

impl EndpointHostAliasResolver {
    pub fn new(
        client: Client,
        service: impl Into<String>,
        namespace: impl Into<String>,
        hosts: Vec<String>,
    ) -> Self {
        Self {
            client,
            service: service.into(),
            namespace: namespace.into(),
            hosts,
        }
    }
}

#[async_trait]
impl HostAliasResolver for EndpointHostAliasResolver {
    async fn host_aliases(&self) -> Result<Vec<HostAlias>> {
        if self.hosts.is_empty() {
            return Ok(Vec::new());
        }
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get_opt(&self.service).await {
            Ok(Some(endpoints)) => Ok(aliases_from_endpoints(&endpoints, &self.hosts)),
            Ok(None) => {
                warn!(service = %self.service, namespace = %self.namespace, "Source mirror service has no endpoints");
                Ok(Vec::new())
            }
            Err(e) => Err(kube_error("get endpoints", e)),
        }
    }
}

pub fn aliases_from_endpoints(endpoints: &Endpoints, hosts: &[String]) -> Vec<HostAlias> {
    let mut ips: Vec<&str> = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|s| s.addresses.iter().flatten())
        .map(|a| a.ip.as_str())
        .collect();
    ips.sort();
    ips.dedup();
    ips.into_iter()
        .map(|ip| HostAlias {
            ip: ip.to_string(),
            hostnames: hosts.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus as K8sJobStatus};
    use kiln_core::ResourceId;
    use kiln_core::job::BuildJobKind;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn build_job() -> BuildJob {
        BuildJob {
            id: ResourceId::new(),
            event_id: "Event-42".into(),
            builder_image: "kaniko:debug".into(),
            source_dir: PathBuf::from("/grdata/source/build/t1/abc"),
            cache_dir: Some(PathBuf::from("/cache/svc1")),
            kind: BuildJobKind::Image {
                dockerfile: "Dockerfile".into(),
                destination: "goodrain.me/svc1:v1".into(),
                build_args: HashMap::new(),
                registry: None,
            },
            env: HashMap::new(),
            host_aliases: vec![HostAlias {
                ip: "10.0.0.7".into(),
                hostnames: vec!["maven.goodrain.me".into()],
            }],
            timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_job_manifest() {
        let job = build_job();
        let manifest = job_manifest(&job, "rbd-system").unwrap();

        assert_eq!(manifest.metadata.name.as_deref(), Some(job.name().as_str()));
        assert_eq!(manifest.metadata.namespace.as_deref(), Some("rbd-system"));
        let spec = manifest.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(600));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.host_aliases.unwrap()[0].ip, "10.0.0.7");
        assert_eq!(pod.volumes.unwrap().len(), 2);
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("kaniko:debug"));
        assert_eq!(container.command.as_ref().unwrap()[0], "/busybox/sh");
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/workspace");
    }

    #[test]
    fn test_job_status_mapping() {
        let mut job = Job::default();
        assert!(matches!(job_status(&job), JobStatus::Pending));

        job.status = Some(K8sJobStatus {
            active: Some(1),
            ..Default::default()
        });
        assert!(matches!(job_status(&job), JobStatus::Running { .. }));

        job.status = Some(K8sJobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert!(matches!(job_status(&job), JobStatus::Succeeded { .. }));

        job.status = Some(K8sJobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                message: Some("DeadlineExceeded".into()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        match job_status(&job) {
            JobStatus::Failed { message, .. } => assert_eq!(message, "DeadlineExceeded"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_aliases_from_endpoints() {
        let endpoints: Endpoints = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": { "name": "rbd-repo" },
            "subsets": [
                { "addresses": [{ "ip": "10.0.0.2" }, { "ip": "10.0.0.1" }] },
                { "addresses": [{ "ip": "10.0.0.2" }] },
            ],
        }))
        .unwrap();
        let hosts = vec!["maven.goodrain.me".to_string(), "lang.goodrain.me".to_string()];

        let aliases = aliases_from_endpoints(&endpoints, &hosts);
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0].ip, "10.0.0.1");
        assert_eq!(aliases[1].hostnames, hosts);
        assert!(aliases_from_endpoints(&Endpoints::default(), &hosts).is_empty());
    }

    /// Requires a reachable cluster.
    #[tokio::test]
    #[ignore]
    async fn test_runs_job_in_cluster() {
        let scheduler = KubernetesJobScheduler::new("default").await.unwrap();
        let mut job = build_job();
        job.builder_image = "busybox:1.36".into();
        job.kind = BuildJobKind::Slug {
            output: PathBuf::from("/tmp/kiln-test/out.tgz"),
            lang: "static".into(),
            runtime: None,
            image: None,
        };
        job.host_aliases.clear();
        scheduler.run(job).await.unwrap();
    }
}
