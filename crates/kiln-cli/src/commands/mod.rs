//! CLI command implementations.

pub mod worker;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use kiln_config::EngineConfig;
use kiln_source::{RepositoryInfo, detect_language};

/// Load the configuration, falling back to defaults plus environment
/// overrides when the file does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        return EngineConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()));
    }
    info!(path = %path.display(), "No config file, using defaults");
    let mut config = EngineConfig::default();
    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("Invalid environment override")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn validate(path: &Path) -> Result<()> {
    match EngineConfig::load(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  max concurrent tasks: {}", config.max_concurrent_tasks);
            println!("  task timeout: {}s", config.task_timeout.as_secs());
            println!("  registry: {}", config.registry.domain);
            println!(
                "  scheduler: {:?}, image runtime: {:?}",
                config.builder.scheduler, config.builder.image_runtime
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub async fn detect(dir: &Path) -> Result<()> {
    let lang = detect_language(dir)
        .await
        .with_context(|| format!("Failed to detect language of {}", dir.display()))?;
    println!("{}", lang);
    Ok(())
}

pub fn cache_path(
    config: &EngineConfig,
    repo_url: &str,
    branch: &str,
    server_type: &str,
    tenant_id: &str,
    service_id: &str,
) -> Result<()> {
    let repo = RepositoryInfo::resolve(
        repo_url,
        branch,
        server_type,
        tenant_id,
        service_id,
        &config.paths.source_dir,
    )
    .with_context(|| format!("Failed to resolve repository: {}", repo_url))?;
    println!("{}", repo.cache_root.display());
    if repo.build_subdir.is_some() {
        println!("{}", repo.build_dir().display());
    }
    Ok(())
}
