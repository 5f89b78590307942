//! Container description shared by the job schedulers.
//!
//! A [`BuildJob`] says what to build; a [`ContainerSpec`] says how the
//! builder container runs it: entrypoint, arguments, environment and mounts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_core::job::{BuildJob, BuildJobKind};
use kiln_core::{HostAlias, RegistryAuth};

/// Where the source tree is mounted for image builds.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Where the layer cache is mounted for image builds.
pub const IMAGE_CACHE_MOUNT: &str = "/cache";
/// Where the slug builder expects the application source.
pub const SLUG_APP_MOUNT: &str = "/tmp/app";
pub const SLUG_CACHE_MOUNT: &str = "/tmp/cache";
pub const SLUG_OUTPUT_MOUNT: &str = "/slug";

/// Writes registry credentials passed in the environment where the image
/// builder looks for them, then hands over to the builder.
const IMAGE_BUILD_SCRIPT: &str = r#"if [ -n "$DOCKER_CONFIG_JSON" ]; then
  mkdir -p /kaniko/.docker
  printf '%s' "$DOCKER_CONFIG_JSON" > /kaniko/.docker/config.json
fi
exec /kaniko/executor "$@""#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Entrypoint override. Empty keeps the image's entrypoint.
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub working_dir: Option<String>,
    pub host_aliases: Vec<HostAlias>,
}

impl ContainerSpec {
    pub fn from_job(job: &BuildJob) -> Self {
        let mut env: BTreeMap<String, String> =
            job.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut spec = Self {
            image: job.builder_image.clone(),
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            working_dir: None,
            host_aliases: job.host_aliases.clone(),
        };

        match &job.kind {
            BuildJobKind::Image {
                dockerfile,
                destination,
                build_args,
                registry,
            } => {
                spec.command = vec![
                    "/busybox/sh".to_string(),
                    "-c".to_string(),
                    IMAGE_BUILD_SCRIPT.to_string(),
                    "kaniko".to_string(),
                ];
                spec.args = vec![
                    format!("--context=dir://{}", WORKSPACE_MOUNT),
                    format!("--dockerfile={}/{}", WORKSPACE_MOUNT, dockerfile),
                    format!("--destination={}", destination),
                ];
                let mut build_args: Vec<_> = build_args.iter().collect();
                build_args.sort();
                spec.args.extend(
                    build_args
                        .into_iter()
                        .map(|(k, v)| format!("--build-arg={}={}", k, v)),
                );
                if let Some(auth) = registry {
                    env.insert("DOCKER_CONFIG_JSON".to_string(), docker_config_json(auth));
                }
                spec.mounts.push(Mount {
                    host: job.source_dir.clone(),
                    container: WORKSPACE_MOUNT.to_string(),
                    read_only: false,
                });
                if let Some(cache_dir) = &job.cache_dir {
                    spec.args.push("--cache=true".to_string());
                    spec.args.push(format!("--cache-dir={}", IMAGE_CACHE_MOUNT));
                    spec.mounts.push(Mount {
                        host: cache_dir.clone(),
                        container: IMAGE_CACHE_MOUNT.to_string(),
                        read_only: false,
                    });
                }
                spec.working_dir = Some(WORKSPACE_MOUNT.to_string());
            }
            BuildJobKind::Slug {
                output,
                lang,
                runtime,
                image,
            } => {
                env.insert("LANGUAGE".to_string(), lang.clone());
                if let Some(runtime) = runtime {
                    env.insert("RUNTIME".to_string(), runtime.clone());
                }
                let file_name = output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "slug.tgz".to_string());
                env.insert(
                    "SLUG_FILE".to_string(),
                    format!("{}/{}", SLUG_OUTPUT_MOUNT, file_name),
                );
                if let Some(image) = image {
                    env.insert("IMAGE".to_string(), image.clone());
                }
                spec.mounts.push(Mount {
                    host: job.source_dir.clone(),
                    container: SLUG_APP_MOUNT.to_string(),
                    read_only: false,
                });
                if let Some(cache_dir) = &job.cache_dir {
                    spec.mounts.push(Mount {
                        host: cache_dir.clone(),
                        container: SLUG_CACHE_MOUNT.to_string(),
                        read_only: false,
                    });
                }
                if let Some(parent) = output.parent() {
                    spec.mounts.push(Mount {
                        host: parent.to_path_buf(),
                        container: SLUG_OUTPUT_MOUNT.to_string(),
                        read_only: false,
                    });
                }
            }
        }

        spec.env = env;
        spec
    }
}

/// Minimal Docker `config.json` holding one registry's credentials.
pub fn docker_config_json(auth: &RegistryAuth) -> String {
    serde_json::json!({
        "auths": {
            (auth.server.as_str()): {
                "username": auth.username,
                "password": auth.password,
            }
        }
    })
    .to_string()
}
