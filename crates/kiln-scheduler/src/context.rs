//! Collaborators shared by every worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_builder::{BackendContext, BackendRegistry, BackendSettings, ImageNamer};
use kiln_config::EngineConfig;
use kiln_core::job::BuildJobScheduler;
use kiln_core::{
    EventLogger, EventSink, HostAliasResolver, ImageOps, ImageRef, Notifier, PluginBuildStore,
    RegistryAuth, Result, VersionStore, WorkloadResolver, path_segment,
};
use kiln_source::{CommandRunner, FetchSettings, SourceFetcher};

use crate::VersionRecorder;

/// External systems the engine talks to.
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub jobs: Arc<dyn BuildJobScheduler>,
    pub image_ops: Arc<dyn ImageOps>,
    pub versions: Arc<dyn VersionStore>,
    pub plugins: Arc<dyn PluginBuildStore>,
    pub workloads: Arc<dyn WorkloadResolver>,
    pub notifier: Arc<dyn Notifier>,
    pub host_aliases: Arc<dyn HostAliasResolver>,
    pub events: Arc<dyn EventSink>,
}

/// Everything a worker may use. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<EngineConfig>,
    pub fetcher: Arc<SourceFetcher>,
    pub backends: Arc<BackendRegistry>,
    pub build: BackendContext,
    pub image_ops: Arc<dyn ImageOps>,
    pub recorder: VersionRecorder,
    pub plugins: Arc<dyn PluginBuildStore>,
    pub notifier: Arc<dyn Notifier>,
    pub host_aliases: Arc<dyn HostAliasResolver>,
    pub events: Arc<dyn EventSink>,
}

impl WorkerContext {
    pub fn new(config: EngineConfig, collab: Collaborators) -> Self {
        let fetcher = SourceFetcher::new(
            FetchSettings {
                ssh_key_dir: config.paths.ssh_key_dir.clone(),
                proxy: config.git.proxy.clone(),
                proxy_host: config.git.proxy_host.clone(),
                timeout: config.fetch_timeout,
            },
            collab.runner,
        );
        let build = BackendContext {
            scheduler: collab.jobs,
            namer: ImageNamer::new(config.registry.domain.clone(), collab.workloads),
            settings: BackendSettings::from_config(&config),
        };
        let backends = BackendRegistry::standard(build.clone());

        Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            backends: Arc::new(backends),
            build,
            image_ops: collab.image_ops,
            recorder: VersionRecorder::new(collab.versions),
            plugins: collab.plugins,
            notifier: collab.notifier,
            host_aliases: collab.host_aliases,
            events: collab.events,
        }
    }

    pub fn logger(&self, event_id: &str) -> EventLogger {
        EventLogger::new(event_id, self.events.clone())
    }

    /// Deadline of one registry operation.
    pub fn registry_timeout(&self) -> Duration {
        self.config.fetch_timeout
    }

    /// Credentials of the platform registry, if configured.
    pub fn platform_auth(&self) -> Option<&RegistryAuth> {
        self.build.settings.registry_auth.as_ref()
    }

    /// Credentials to pull `image`: the ones supplied with the task, else the
    /// platform's own when the image lives on the platform registry.
    pub fn pull_auth(
        &self,
        image: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Option<RegistryAuth> {
        if let Some(auth) = RegistryAuth::for_image(user, password, image) {
            return Some(auth);
        }
        let on_platform = ImageRef::parse(image).registry() == Some(self.build.namer.domain());
        if on_platform {
            self.platform_auth().cloned()
        } else {
            None
        }
    }

    /// Dependency cache of one service. Both ids must be single path segments.
    pub fn service_cache_dir(&self, tenant_id: &str, service_id: &str) -> Result<PathBuf> {
        Ok(self
            .config
            .paths
            .cache_dir
            .join("build")
            .join(path_segment("tenant_id", tenant_id)?)
            .join("cache")
            .join(path_segment("service_id", service_id)?))
    }

    /// Directory holding every slug of one service.
    pub fn service_slug_dir(&self, tenant_id: &str, service_id: &str) -> Result<PathBuf> {
        Ok(self
            .config
            .paths
            .slug_dir
            .join(path_segment("tenant_id", tenant_id)?)
            .join("slug")
            .join(path_segment("service_id", service_id)?))
    }

    /// Slug of one deploy version. Same layout the slug backend writes.
    pub fn slug_file(
        &self,
        tenant_id: &str,
        service_id: &str,
        deploy_version: &str,
    ) -> Result<PathBuf> {
        let version = path_segment("deploy_version", deploy_version)?;
        Ok(self
            .service_slug_dir(tenant_id, service_id)?
            .join(format!("{}.tgz", version)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use kiln_core::event::MemoryEventSink;
    use kiln_core::job::{BuildJob, JobHandle, JobStatus};
    use kiln_core::{Error, Result, StaticHostAliases};
    use kiln_db::MemoryStore;
    use kiln_source::{CommandOutput, CommandSpec, FetchError};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::notify::{ChannelNotifier, Delivery};

    /// Image runtime that records operations and fails the first
    /// `failures` of them.
    #[derive(Default)]
    pub struct FakeImageOps {
        pub calls: Mutex<Vec<String>>,
        pub failures: AtomicU32,
    }

    impl FakeImageOps {
        pub fn failing(failures: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: AtomicU32::new(failures),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, op: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.split(' ').next() == Some(op))
                .count()
        }

        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call.clone());
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ExecutionFailed(format!("{} refused", call)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ImageOps for FakeImageOps {
        fn runtime(&self) -> &'static str {
            "fake"
        }

        async fn pull(
            &self,
            image: &str,
            _auth: Option<&RegistryAuth>,
            _logger: &EventLogger,
            _timeout: Duration,
        ) -> Result<()> {
            self.record(format!("pull {}", image))
        }

        async fn push(
            &self,
            image: &str,
            _auth: Option<&RegistryAuth>,
            _logger: &EventLogger,
            _timeout: Duration,
        ) -> Result<()> {
            self.record(format!("push {}", image))
        }

        async fn tag(
            &self,
            source: &str,
            target: &str,
            _logger: &EventLogger,
            _timeout: Duration,
        ) -> Result<()> {
            self.record(format!("tag {} {}", source, target))
        }

        async fn remove(&self, image: &str, _logger: &EventLogger, _timeout: Duration) -> Result<()> {
            self.record(format!("remove {}", image))
        }

        async fn save(
            &self,
            image: &str,
            dest: &Path,
            _logger: &EventLogger,
            _timeout: Duration,
        ) -> Result<()> {
            self.record(format!("save {} {}", image, dest.display()))
        }

        async fn load(&self, src: &Path, _logger: &EventLogger, _timeout: Duration) -> Result<()> {
            self.record(format!("load {}", src.display()))
        }
    }

    /// Job scheduler whose jobs succeed at once.
    #[derive(Default)]
    pub struct FakeJobs {
        pub jobs: Mutex<Vec<BuildJob>>,
    }

    impl FakeJobs {
        pub fn jobs(&self) -> Vec<BuildJob> {
            self.jobs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildJobScheduler for FakeJobs {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn submit(&self, job: BuildJob) -> Result<JobHandle> {
            let handle = JobHandle {
                id: job.id.clone(),
                scheduler_id: job.name(),
                scheduler_name: "fake".to_string(),
            };
            self.jobs.lock().unwrap().push(job);
            Ok(handle)
        }

        async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(JobStatus::Succeeded {
                finished_at: Utc::now(),
            })
        }

        async fn wait(&self, handle: &JobHandle) -> Result<JobStatus> {
            self.status(handle).await
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
            Ok(())
        }
    }

    type Script = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    /// Command runner answering from a script.
    pub struct FakeRunner {
        pub calls: Mutex<Vec<CommandSpec>>,
        script: Script,
    }

    impl FakeRunner {
        pub fn new(script: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                script: Box::new(script),
            }
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        /// Number of `git clone` invocations.
        pub fn clones(&self) -> usize {
            self.calls().iter().filter(|c| c.has_arg("clone")).count()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, FetchError> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok((self.script)(spec))
        }
    }

    /// Stand-in for `git`: `clone` creates the destination with the given
    /// files, `log` prints one commit.
    pub fn git_script(
        files: &'static [&'static str],
    ) -> impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static {
        move |spec: &CommandSpec| {
            if spec.has_arg("clone") {
                if let Some(dest) = spec.args.last() {
                    std::fs::create_dir_all(dest).unwrap();
                    for file in files {
                        std::fs::write(Path::new(dest).join(file), "").unwrap();
                    }
                }
                CommandOutput::ok("")
            } else if spec.has_arg("log") {
                CommandOutput::ok("0123456789abcdef\u{1f}Jane Dev\u{1f}Fix build\n")
            } else {
                CommandOutput::ok("")
            }
        }
    }

    /// A context over in-memory collaborators rooted in a temp dir.
    pub struct Harness {
        pub ctx: WorkerContext,
        pub events: Arc<MemoryEventSink>,
        pub store: Arc<MemoryStore>,
        pub image_ops: Arc<FakeImageOps>,
        pub jobs: Arc<FakeJobs>,
        pub runner: Arc<FakeRunner>,
        pub deliveries: mpsc::Receiver<Delivery>,
        pub dir: TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::build(FakeImageOps::default(), FakeRunner::new(git_script(&[])), |_| {})
        }

        pub fn build(
            image_ops: FakeImageOps,
            runner: FakeRunner,
            configure: impl FnOnce(&mut EngineConfig),
        ) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = EngineConfig::default();
            config.paths.source_dir = dir.path().join("source");
            config.paths.cache_dir = dir.path().join("cache");
            config.paths.slug_dir = dir.path().join("slug");
            config.paths.ssh_key_dir = dir.path().join("ssh");
            config.registry.user = Some("admin".to_string());
            config.registry.password = Some("secret".to_string());
            config.task_timeout = Duration::from_secs(30);
            config.fetch_timeout = Duration::from_secs(5);
            configure(&mut config);

            let events = Arc::new(MemoryEventSink::new());
            let store = Arc::new(MemoryStore::new());
            let image_ops = Arc::new(image_ops);
            let jobs = Arc::new(FakeJobs::default());
            let runner = Arc::new(runner);
            let (notifier, deliveries) = ChannelNotifier::new(64);

            let ctx = WorkerContext::new(
                config,
                Collaborators {
                    runner: runner.clone(),
                    jobs: jobs.clone(),
                    image_ops: image_ops.clone(),
                    versions: store.clone(),
                    plugins: store.clone(),
                    workloads: store.clone(),
                    notifier: Arc::new(notifier),
                    host_aliases: Arc::new(StaticHostAliases::default()),
                    events: events.clone(),
                },
            );

            Self {
                ctx,
                events,
                store,
                image_ops,
                jobs,
                runner,
                deliveries,
                dir,
            }
        }

        /// Everything delivered so far.
        pub fn drain(&mut self) -> Vec<Delivery> {
            let mut out = Vec::new();
            while let Ok(delivery) = self.deliveries.try_recv() {
                out.push(delivery);
            }
            out
        }
    }
}
