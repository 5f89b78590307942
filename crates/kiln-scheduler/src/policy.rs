//! Per task type retry and concurrency-slot policy.

use std::time::Duration;

use kiln_config::EngineConfig;
use kiln_core::TaskType;

/// How long a worker holds its admission slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotMode {
    /// Held until the worker returns.
    #[default]
    Hold,
    /// Released as soon as the worker is dispatched. For workers that hand
    /// their real work to a long-running external job.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self::attempts(1)
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            pause: Duration::ZERO,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// Everything the engine needs to know to run one kind of task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskPolicy {
    pub retry: RetryPolicy,
    pub slot: SlotMode,
}

impl TaskPolicy {
    /// Built-in policy of a statically dispatched task type.
    ///
    /// Registry pulls and pushes are often transiently flaky, so image,
    /// package and share tasks get a second attempt. Source builds and checks
    /// are expensive to repeat and usually fail deterministically.
    pub fn builtin(task_type: TaskType) -> Self {
        let attempts = match task_type {
            TaskType::BuildFromImage
            | TaskType::BuildFromMarketSlug
            | TaskType::PluginImageBuild
            | TaskType::PluginDockerfileBuild
            | TaskType::SlugShare
            | TaskType::ImageShare => 2,
            TaskType::BuildFromSourceCode
            | TaskType::ServiceSourceCheck
            | TaskType::GarbageCollection => 1,
        };
        Self {
            retry: RetryPolicy::attempts(attempts),
            slot: SlotMode::Hold,
        }
    }

    /// Built-in policy with the configured attempt override and retry pause.
    pub fn configured(task_type: TaskType, config: &EngineConfig) -> Self {
        let mut policy = Self::builtin(task_type);
        if let Some(attempts) = config.retry_overrides.get(&task_type) {
            policy.retry.max_attempts = (*attempts).max(1);
        }
        policy.retry.pause = config.retry_pause;
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_attempts() {
        assert_eq!(TaskPolicy::builtin(TaskType::BuildFromImage).retry.max_attempts, 2);
        assert_eq!(TaskPolicy::builtin(TaskType::BuildFromSourceCode).retry.max_attempts, 1);
        assert_eq!(TaskPolicy::builtin(TaskType::PluginDockerfileBuild).retry.max_attempts, 2);
        assert_eq!(TaskPolicy::builtin(TaskType::GarbageCollection).retry.max_attempts, 1);
        assert!(
            TaskType::ALL
                .iter()
                .all(|t| TaskPolicy::builtin(*t).slot == SlotMode::Hold)
        );
    }

    #[test]
    fn test_configured_overrides() {
        let mut config = EngineConfig::default();
        config.retry_overrides.insert(TaskType::BuildFromSourceCode, 3);
        config.retry_pause = Duration::from_secs(2);

        let source = TaskPolicy::configured(TaskType::BuildFromSourceCode, &config);
        assert_eq!(source.retry.max_attempts, 3);
        assert_eq!(source.retry.pause, Duration::from_secs(2));

        let image = TaskPolicy::configured(TaskType::BuildFromImage, &config);
        assert_eq!(image.retry.max_attempts, 2);
    }
}
