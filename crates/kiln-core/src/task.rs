//! Inbound task envelopes and the known task types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, TaskId};

/// Task types the engine dispatches through its static table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    BuildFromImage,
    BuildFromSourceCode,
    /// Deprecated upstream, still accepted.
    BuildFromMarketSlug,
    ServiceSourceCheck,
    PluginImageBuild,
    PluginDockerfileBuild,
    /// Deprecated upstream, still accepted.
    SlugShare,
    ImageShare,
    GarbageCollection,
}

impl TaskType {
    pub const ALL: [TaskType; 9] = [
        TaskType::BuildFromImage,
        TaskType::BuildFromSourceCode,
        TaskType::BuildFromMarketSlug,
        TaskType::ServiceSourceCheck,
        TaskType::PluginImageBuild,
        TaskType::PluginDockerfileBuild,
        TaskType::SlugShare,
        TaskType::ImageShare,
        TaskType::GarbageCollection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::BuildFromImage => "build-from-image",
            TaskType::BuildFromSourceCode => "build-from-source-code",
            TaskType::BuildFromMarketSlug => "build-from-market-slug",
            TaskType::ServiceSourceCheck => "service-source-check",
            TaskType::PluginImageBuild => "plugin-image-build",
            TaskType::PluginDockerfileBuild => "plugin-dockerfile-build",
            TaskType::SlugShare => "slug-share",
            TaskType::ImageShare => "image-share",
            TaskType::GarbageCollection => "garbage-collection",
        }
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, TaskType::BuildFromMarketSlug | TaskType::SlugShare)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    /// Accepts both `build-from-image` and `build_from_image` spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("Unknown task type: {}", s))
    }
}

/// An inbound task envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "task_id", default)]
    pub id: TaskId,
    /// Wire name of the task type. Unknown names are resolved through the
    /// open worker registry.
    pub task_type: String,
    /// Opaque, type-specific payload.
    #[serde(default)]
    pub task_body: serde_json::Value,
    /// Submitting operator.
    #[serde(default)]
    pub user: String,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, task_body: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            task_body,
            user: String::new(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// The task type if it is one of the statically dispatched kinds.
    pub fn known_type(&self) -> Option<TaskType> {
        self.task_type.parse().ok()
    }

    /// Decode the payload into its type-specific struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.task_body.clone()).map_err(|e| {
            Error::InvalidInput(format!(
                "malformed {} payload for task {}: {}",
                self.task_type, self.id, e
            ))
        })
    }

    /// Event id carried by the payload, falling back to the task id.
    pub fn event_id(&self) -> String {
        self.task_body
            .get("event_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.id.to_string())
    }
}
