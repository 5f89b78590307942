//! Engine configuration parsing.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Environment overrides are applied after parsing.

use kdl::{KdlDocument, KdlNode};
use kiln_core::TaskType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Admission capacity. Also the number of tasks that may run at once.
    pub max_concurrent_tasks: usize,
    /// Overall deadline of one task.
    pub task_timeout: Duration,
    /// Deadline of a single fetch sub-step (clone, pull, download).
    pub fetch_timeout: Duration,
    /// Pause between attempts of a retried task.
    pub retry_pause: Duration,
    pub paths: PathsConfig,
    pub registry: RegistryConfig,
    pub git: GitConfig,
    pub builder: BuilderConfig,
    pub source_mirror: Option<SourceMirrorConfig>,
    /// Max attempts per task type, overriding the built-in policy.
    pub retry_overrides: HashMap<TaskType, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root under which source caches are created.
    pub source_dir: PathBuf,
    /// Dependency cache shared across builds.
    pub cache_dir: PathBuf,
    /// Root under which slug bundles are written.
    pub slug_dir: PathBuf,
    /// Directory holding `builder_rsa` and per-tenant SSH keys.
    pub ssh_key_dir: PathBuf,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry domain every built image is namespaced under.
    pub domain: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("domain", &self.domain)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// HTTP proxy used for clones from `proxy_host`.
    pub proxy: Option<String>,
    pub proxy_host: String,
}

/// Which external job scheduler runs build jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Kubernetes,
    Docker,
}

/// Which container runtime implements image operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRuntimeKind {
    Docker,
    Containerd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Image that builds and pushes Dockerfile builds.
    pub image_builder: String,
    /// Image that packages slug bundles.
    pub slug_builder: String,
    /// Namespace build jobs run in.
    pub namespace: String,
    pub scheduler: SchedulerKind,
    pub image_runtime: ImageRuntimeKind,
}

/// Service whose endpoints are injected into build jobs as host aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMirrorConfig {
    pub service: String,
    pub namespace: String,
    pub hosts: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("/grdata/source"),
            cache_dir: PathBuf::from("/cache"),
            slug_dir: PathBuf::from("/grdata/build/tenant"),
            ssh_key_dir: PathBuf::from("/grdata/build/ssh"),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            domain: "goodrain.me".to_string(),
            user: None,
            password: None,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            proxy_host: "github.com".to_string(),
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            image_builder: "gcr.io/kaniko-project/executor:debug".to_string(),
            slug_builder: "goodrain.me/builder:latest".to_string(),
            namespace: "rbd-system".to_string(),
            scheduler: SchedulerKind::Kubernetes,
            image_runtime: ImageRuntimeKind::Docker,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 50,
            task_timeout: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(600),
            retry_pause: Duration::ZERO,
            paths: PathsConfig::default(),
            registry: RegistryConfig::default(),
            git: GitConfig::default(),
            builder: BuilderConfig::default(),
            source_mirror: None,
            retry_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file, apply environment overrides and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = parse_engine_config(&text)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KILN_*` overrides. `lookup` is the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KILN_MAX_TASKS") {
            self.max_concurrent_tasks = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("KILN_MAX_TASKS", format!("not a number: {}", v)))?;
        }
        if let Some(v) = lookup("KILN_SOURCE_DIR") {
            self.paths.source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_CACHE_DIR") {
            self.paths.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_SLUG_DIR") {
            self.paths.slug_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_SSH_KEY_DIR") {
            self.paths.ssh_key_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_REGISTRY_DOMAIN") {
            self.registry.domain = v;
        }
        if let Some(v) = lookup("KILN_GIT_PROXY") {
            self.git.proxy = Some(v).filter(|p| !p.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::invalid(
                "max-concurrent-tasks",
                "must be at least 1",
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::invalid("task-timeout-secs", "must be positive"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::invalid("fetch-timeout-secs", "must be positive"));
        }
        if self.registry.domain.trim().is_empty() {
            return Err(ConfigError::MissingField("registry domain".to_string()));
        }
        for (task_type, attempts) in &self.retry_overrides {
            if *attempts == 0 {
                return Err(ConfigError::invalid(
                    "retry",
                    format!("attempts for {} must be at least 1", task_type),
                ));
            }
        }
        Ok(())
    }
}

/// Parse an engine configuration from KDL text.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = EngineConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "engine" => parse_engine(node, &mut config)?,
            "paths" => parse_paths(node, &mut config.paths),
            "registry" => {
                if let Some(domain) = get_string_prop(node, "domain") {
                    config.registry.domain = domain;
                }
                config.registry.user = get_string_prop(node, "user");
                config.registry.password = get_string_prop(node, "password");
            }
            "git" => parse_git(node, &mut config.git),
            "builder" => parse_builder(node, &mut config.builder)?,
            "source-mirror" => {
                if config.source_mirror.is_some() {
                    return Err(ConfigError::Duplicate("source-mirror".to_string()));
                }
                config.source_mirror = Some(parse_source_mirror(node)?);
            }
            "retry" => {
                let (task_type, attempts) = parse_retry(node)?;
                if config.retry_overrides.insert(task_type, attempts).is_some() {
                    return Err(ConfigError::Duplicate(format!("retry {}", task_type)));
                }
            }
            other => {
                tracing::warn!(node = other, "Ignoring unknown configuration node");
            }
        }
    }

    Ok(config)
}

fn parse_engine(node: &KdlNode, config: &mut EngineConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "max-concurrent-tasks" => {
                config.max_concurrent_tasks = get_first_uint_arg(child, "max-concurrent-tasks")? as usize;
            }
            "task-timeout-secs" => {
                config.task_timeout =
                    Duration::from_secs(get_first_uint_arg(child, "task-timeout-secs")?);
            }
            "fetch-timeout-secs" => {
                config.fetch_timeout =
                    Duration::from_secs(get_first_uint_arg(child, "fetch-timeout-secs")?);
            }
            "retry-pause-secs" => {
                config.retry_pause =
                    Duration::from_secs(get_first_uint_arg(child, "retry-pause-secs")?);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_paths(node: &KdlNode, paths: &mut PathsConfig) {
    let Some(children) = node.children() else {
        return;
    };
    for child in children.nodes() {
        let Some(value) = get_first_string_arg(child) else {
            continue;
        };
        match child.name().value() {
            "source-dir" => paths.source_dir = PathBuf::from(value),
            "cache-dir" => paths.cache_dir = PathBuf::from(value),
            "slug-dir" => paths.slug_dir = PathBuf::from(value),
            "ssh-key-dir" => paths.ssh_key_dir = PathBuf::from(value),
            _ => {}
        }
    }
}

fn parse_git(node: &KdlNode, git: &mut GitConfig) {
    let Some(children) = node.children() else {
        return;
    };
    for child in children.nodes() {
        if child.name().value() == "proxy" {
            git.proxy = get_first_string_arg(child).filter(|p| !p.is_empty());
            if let Some(host) = get_string_prop(child, "host") {
                git.proxy_host = host;
            }
        }
    }
}

fn parse_builder(node: &KdlNode, builder: &mut BuilderConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        let value = get_first_string_arg(child).unwrap_or_default();
        match child.name().value() {
            "image-builder" => builder.image_builder = value,
            "slug-builder" => builder.slug_builder = value,
            "namespace" => builder.namespace = value,
            "scheduler" => {
                builder.scheduler = match value.as_str() {
                    "kubernetes" => SchedulerKind::Kubernetes,
                    "docker" => SchedulerKind::Docker,
                    _ => {
                        return Err(ConfigError::invalid(
                            "builder scheduler",
                            format!("unknown scheduler: {}", value),
                        ));
                    }
                }
            }
            "image-runtime" => {
                builder.image_runtime = match value.as_str() {
                    "docker" => ImageRuntimeKind::Docker,
                    "containerd" => ImageRuntimeKind::Containerd,
                    _ => {
                        return Err(ConfigError::invalid(
                            "builder image-runtime",
                            format!("unknown runtime: {}", value),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_source_mirror(node: &KdlNode) -> ConfigResult<SourceMirrorConfig> {
    let service = get_string_prop(node, "service")
        .ok_or_else(|| ConfigError::MissingField("source-mirror service".to_string()))?;
    let namespace = get_string_prop(node, "namespace").unwrap_or_else(|| "default".to_string());

    let mut hosts = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "host" {
                if let Some(host) = get_first_string_arg(child) {
                    hosts.push(host);
                }
            }
        }
    }

    Ok(SourceMirrorConfig {
        service,
        namespace,
        hosts,
    })
}

fn parse_retry(node: &KdlNode) -> ConfigResult<(TaskType, u32)> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("retry task type".to_string()))?;
    let task_type: TaskType = name
        .parse()
        .map_err(|e: String| ConfigError::invalid("retry", e))?;
    let attempts = node
        .get("attempts")
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::MissingField(format!("attempts for retry {}", name)))?;
    let attempts = u32::try_from(attempts)
        .map_err(|_| ConfigError::invalid("retry", format!("bad attempts: {}", attempts)))?;
    Ok((task_type, attempts))
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_uint_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    u64::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("must not be negative: {}", value)))
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}
