//! Version records: the persisted outcome of a build, keyed by
//! (service id, deploy version).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildResponse, Commit, Medium, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Success,
    Failure,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Success => "success",
            FinalStatus::Failure => "failure",
        }
    }
}

impl std::str::FromStr for FinalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(FinalStatus::Success),
            "failure" => Ok(FinalStatus::Failure),
            _ => Err(format!("Unknown final status: {}", s)),
        }
    }
}

/// Key of a version record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub service_id: String,
    pub deploy_version: String,
}

impl VersionKey {
    pub fn new(service_id: impl Into<String>, deploy_version: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            deploy_version: deploy_version.into(),
        }
    }
}

/// A persisted build outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: VersionKey,
    pub event_id: String,
    pub delivered_type: Option<Medium>,
    pub delivered_path: Option<String>,
    pub image_name: Option<String>,
    pub final_status: Option<FinalStatus>,
    pub code_version: Option<String>,
    pub code_branch: Option<String>,
    pub commit_msg: Option<String>,
    pub author: Option<String>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl VersionRecord {
    pub fn new(key: VersionKey) -> Self {
        Self {
            key,
            event_id: String::new(),
            delivered_type: None,
            delivered_path: None,
            image_name: None,
            final_status: None,
            code_version: None,
            code_branch: None,
            commit_msg: None,
            author: None,
            finish_time: None,
        }
    }

    /// Apply an update.
    ///
    /// Present fields overwrite absent or older values, except the terminal
    /// outcome: once `final_status` is set it never changes, and neither does
    /// `finish_time`. A new attempt uses a new deploy version.
    pub fn apply(&mut self, update: &VersionUpdate) {
        if let Some(event_id) = &update.event_id {
            self.event_id = event_id.clone();
        }
        if update.delivered_type.is_some() {
            self.delivered_type = update.delivered_type;
        }
        if update.delivered_path.is_some() {
            self.delivered_path = update.delivered_path.clone();
        }
        if update.image_name.is_some() {
            self.image_name = update.image_name.clone();
        }
        if let Some(commit) = &update.commit {
            self.code_version = Some(commit.hash.clone());
            self.author = Some(commit.author.clone());
            self.commit_msg = Some(commit.message.clone());
        }
        if update.code_branch.is_some() {
            self.code_branch = update.code_branch.clone();
        }
        if self.final_status.is_none() {
            if let Some(status) = update.final_status {
                self.final_status = Some(status);
                self.finish_time = Some(update.finish_time.unwrap_or_else(Utc::now));
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.final_status.is_some()
    }
}

/// A partial write against a version record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionUpdate {
    pub event_id: Option<String>,
    pub delivered_type: Option<Medium>,
    pub delivered_path: Option<String>,
    pub image_name: Option<String>,
    pub final_status: Option<FinalStatus>,
    pub commit: Option<Commit>,
    pub code_branch: Option<String>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl VersionUpdate {
    pub fn success(event_id: &str, response: &BuildResponse) -> Self {
        let image_name = match response.medium {
            Medium::Image => Some(response.path.clone()),
            Medium::Slug => None,
        };
        Self {
            event_id: Some(event_id.to_string()),
            delivered_type: Some(response.medium),
            delivered_path: Some(response.path.clone()),
            image_name,
            final_status: Some(FinalStatus::Success),
            finish_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failure(event_id: &str) -> Self {
        Self {
            event_id: Some(event_id.to_string()),
            final_status: Some(FinalStatus::Failure),
            finish_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_commit(mut self, commit: Option<&Commit>) -> Self {
        self.commit = commit.cloned();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if !branch.is_empty() {
            self.code_branch = Some(branch);
        }
        self
    }
}

/// Narrow persistence contract for version records.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn get(&self, key: &VersionKey) -> Result<Option<VersionRecord>>;

    /// Create the record if missing, then apply the update.
    async fn upsert(&self, key: &VersionKey, update: &VersionUpdate) -> Result<VersionRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginBuildStatus {
    Building,
    Complete,
    Failure,
}

impl PluginBuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginBuildStatus::Building => "building",
            PluginBuildStatus::Complete => "complete",
            PluginBuildStatus::Failure => "failure",
        }
    }
}

impl std::str::FromStr for PluginBuildStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "building" => Ok(PluginBuildStatus::Building),
            "complete" => Ok(PluginBuildStatus::Complete),
            "failure" => Ok(PluginBuildStatus::Failure),
            _ => Err(format!("Unknown plugin build status: {}", s)),
        }
    }
}

/// Build state of one plugin version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginBuildRecord {
    pub plugin_id: String,
    pub version_id: String,
    pub event_id: String,
    pub status: PluginBuildStatus,
    pub image: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PluginBuildStore: Send + Sync {
    async fn get(&self, plugin_id: &str, version_id: &str) -> Result<Option<PluginBuildRecord>>;
    async fn put(&self, record: PluginBuildRecord) -> Result<()>;
}

/// Names a service's workload from its component, application and tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadName {
    pub namespace: String,
    pub app: String,
    pub component: String,
}

impl std::fmt::Display for WorkloadName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.namespace, self.app, self.component)
    }
}

/// Relational lookups used for image naming.
#[async_trait]
pub trait WorkloadResolver: Send + Sync {
    /// `Ok(None)` when any of the lookups has no row.
    async fn workload_name(&self, service_id: &str) -> Result<Option<WorkloadName>>;
}
