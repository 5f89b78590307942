//! Build requests, responses and the languages that select a backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::Result;

/// Kind of artifact a build delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Image,
    Slug,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Image => "image",
            Medium::Slug => "slug",
        }
    }
}

impl std::fmt::Display for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Medium {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(Medium::Image),
            "slug" => Ok(Medium::Slug),
            _ => Err(format!("Unknown medium: {}", s)),
        }
    }
}

/// Detected or declared source language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Dockerfile,
    Docker,
    NetCore,
    JavaMaven,
    JavaJar,
    JavaWar,
    Gradle,
    Python,
    Php,
    Golang,
    NodeJs,
    NodeJsStatic,
    Static,
    /// Anything unrecognized, including an empty declaration.
    Unknown(String),
}

impl Language {
    /// Parse a declared language. Never fails; unrecognized values map to
    /// `Unknown` so backend lookup can fall back.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "dockerfile" => Language::Dockerfile,
            "docker" => Language::Docker,
            "netcore" | ".netcore" | "dotnet" => Language::NetCore,
            "java-maven" | "java_maven" | "maven" => Language::JavaMaven,
            "java-jar" | "java_jar" | "jar" => Language::JavaJar,
            "java-war" | "java_war" | "war" => Language::JavaWar,
            "gradle" | "java-gradle" => Language::Gradle,
            "python" => Language::Python,
            "php" => Language::Php,
            "go" | "golang" => Language::Golang,
            "nodejs" | "node.js" | "node" => Language::NodeJs,
            "nodejsstatic" | "nodejs-static" => Language::NodeJsStatic,
            "static" => Language::Static,
            _ => Language::Unknown(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Language::Dockerfile => "dockerfile",
            Language::Docker => "docker",
            Language::NetCore => "netcore",
            Language::JavaMaven => "Java-maven",
            Language::JavaJar => "Java-jar",
            Language::JavaWar => "Java-war",
            Language::Gradle => "Gradle",
            Language::Python => "Python",
            Language::Php => "PHP",
            Language::Golang => "Go",
            Language::NodeJs => "Node.js",
            Language::NodeJsStatic => "NodeJSStatic",
            Language::Static => "static",
            Language::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Language::Unknown(_))
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of the fetched revision. Absent for archive sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    pub message: String,
}

impl Commit {
    /// Hash truncated to 7 characters for display.
    pub fn short_hash(&self) -> &str {
        match self.hash.char_indices().nth(7) {
            Some((idx, _)) => &self.hash[..idx],
            None => &self.hash,
        }
    }
}

/// A static `/etc/hosts` entry injected into build jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

/// Resolves host aliases for build jobs, typically from the network
/// endpoints of a running source-mirror service.
#[async_trait]
pub trait HostAliasResolver: Send + Sync {
    async fn host_aliases(&self) -> Result<Vec<HostAlias>>;
}

/// Fixed host aliases from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticHostAliases(pub Vec<HostAlias>);

#[async_trait]
impl HostAliasResolver for StaticHostAliases {
    async fn host_aliases(&self) -> Result<Vec<HostAlias>> {
        Ok(self.0.clone())
    }
}

/// Immutable description of one build attempt, consumed by exactly one
/// backend invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub event_id: String,
    pub tenant_id: String,
    pub service_id: String,
    pub service_alias: String,
    pub deploy_version: String,
    pub lang: Language,
    pub runtime: Option<String>,
    /// Root of the fetched tree, including any build subdirectory.
    pub source_dir: PathBuf,
    /// Dependency cache shared across builds of this service.
    pub cache_dir: PathBuf,
    /// Directory slug bundles are written under.
    pub slug_dir: PathBuf,
    pub branch: String,
    pub commit: Option<Commit>,
    pub build_envs: HashMap<String, String>,
    /// Preferred medium when a backend can produce either.
    pub medium_hint: Option<Medium>,
    pub host_aliases: Vec<HostAlias>,
}

impl BuildRequest {
    /// Whether the caller asked to bypass every cache.
    pub fn no_cache(&self) -> bool {
        self.build_envs.contains_key("NO_CACHE")
    }
}

/// Output of a successful backend invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    pub medium: Medium,
    /// Image reference or slug file path.
    pub path: String,
}
