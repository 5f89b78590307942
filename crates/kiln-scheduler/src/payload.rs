//! Typed task payloads.
//!
//! Field names follow the wire format of the inbound task bodies. Anything
//! optional defaults so that older producers keep working.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use kiln_core::Medium;

fn default_action() -> String {
    "upgrade".to_string()
}

/// `build-from-source-code`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBuildPayload {
    pub event_id: String,
    pub tenant_id: String,
    pub service_id: String,
    #[serde(default)]
    pub service_alias: String,
    pub deploy_version: String,
    #[serde(default = "default_action")]
    pub action: String,
    /// Declared language. Empty or unrecognized falls back to the slug
    /// backend.
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    pub repo_url: String,
    #[serde(default)]
    pub branch: String,
    /// `git`, `svn`, `oss` or empty to infer from the URL.
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Re-run language detection on the fetched tree.
    #[serde(default)]
    pub reparse: bool,
    #[serde(default)]
    pub medium: Option<Medium>,
    /// Arbitrary service configuration, passed to the build as environment.
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

/// `build-from-image`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuildPayload {
    pub event_id: String,
    pub tenant_id: String,
    pub service_id: String,
    pub deploy_version: String,
    #[serde(default = "default_action")]
    pub action: String,
    pub image: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// `build-from-market-slug`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSlugPayload {
    pub event_id: String,
    pub tenant_id: String,
    pub service_id: String,
    pub deploy_version: String,
    #[serde(default = "default_action")]
    pub action: String,
    /// HTTP(S) URL or local path of the slug package.
    pub slug_path: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckSource {
    SourceCode,
    Image,
}

/// `service-source-check`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCheckPayload {
    pub event_id: String,
    pub tenant_id: String,
    pub check_id: String,
    #[serde(default)]
    pub service_id: String,
    pub source_type: CheckSource,
    /// Repository URL or image reference.
    pub source_body: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// `plugin-image-build`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginImagePayload {
    pub event_id: String,
    pub tenant_id: String,
    pub plugin_id: String,
    pub version_id: String,
    pub image_url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// `plugin-dockerfile-build`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDockerfilePayload {
    pub event_id: String,
    pub tenant_id: String,
    pub plugin_id: String,
    pub version_id: String,
    pub git_url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub build_envs: HashMap<String, String>,
}

/// `image-share`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSharePayload {
    pub event_id: String,
    pub share_id: String,
    /// Image as stored on the platform registry.
    pub image: String,
    pub target_image: String,
    #[serde(default)]
    pub target_user: Option<String>,
    #[serde(default)]
    pub target_password: Option<String>,
}

/// `slug-share`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlugSharePayload {
    pub event_id: String,
    pub share_id: String,
    pub slug_path: String,
    /// Directory the slug is copied into.
    pub target_dir: String,
}

/// `garbage-collection`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcPayload {
    #[serde(default)]
    pub event_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub service_ids: Vec<String>,
    /// Local image references to remove.
    #[serde(default)]
    pub images: Vec<String>,
}
