//! Task type to worker dispatch table.
//!
//! Known task types resolve through a static table built at startup. Any
//! other name resolves through an open registry of factories, so new task
//! kinds can be added without touching the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_config::EngineConfig;
use kiln_core::{Result, Task, TaskType, WorkerTask};

use crate::policy::TaskPolicy;
use crate::workers;
use crate::{SchedulerError, WorkerContext};

/// Creates the worker for one task.
pub trait WorkerFactory: Send + Sync {
    /// Decode the task and build its worker. Errors are terminal for the
    /// task; they are never retried.
    fn create(&self, task: &Task, ctx: &WorkerContext) -> Result<Box<dyn WorkerTask>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&Task, &WorkerContext) -> Result<Box<dyn WorkerTask>> + Send + Sync,
{
    fn create(&self, task: &Task, ctx: &WorkerContext) -> Result<Box<dyn WorkerTask>> {
        self(task, ctx)
    }
}

/// A factory and the policy its tasks run under.
#[derive(Clone)]
pub struct Registration {
    pub factory: Arc<dyn WorkerFactory>,
    pub policy: TaskPolicy,
}

pub struct WorkerRegistry {
    builtin: HashMap<TaskType, Registration>,
    custom: HashMap<String, Registration>,
}

impl WorkerRegistry {
    /// A registry with no workers at all.
    pub fn empty() -> Self {
        Self {
            builtin: HashMap::new(),
            custom: HashMap::new(),
        }
    }

    /// The static table of every known task type, with policies from `config`.
    pub fn builtin(config: &EngineConfig) -> Self {
        let mut registry = Self::empty();
        for task_type in TaskType::ALL {
            registry.builtin.insert(
                task_type,
                Registration {
                    factory: workers::factory(task_type),
                    policy: TaskPolicy::configured(task_type, config),
                },
            );
        }
        registry
    }

    /// Register a worker for a task type outside the static table.
    pub fn register(
        &mut self,
        name: &str,
        policy: TaskPolicy,
        factory: impl WorkerFactory + 'static,
    ) -> std::result::Result<(), SchedulerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SchedulerError::EmptyName);
        }
        if name.parse::<TaskType>().is_ok() {
            return Err(SchedulerError::ReservedName(name.to_string()));
        }
        if policy.retry.max_attempts == 0 {
            return Err(SchedulerError::InvalidPolicy(name.to_string()));
        }
        if self.custom.contains_key(name) {
            return Err(SchedulerError::DuplicateWorker(name.to_string()));
        }
        self.custom.insert(
            name.to_string(),
            Registration {
                factory: Arc::new(factory),
                policy,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, task_type: &str) -> Option<&Registration> {
        match task_type.parse::<TaskType>() {
            Ok(known) => self.builtin.get(&known),
            Err(_) => self.custom.get(task_type.trim()),
        }
    }

    /// Names of every dispatchable task type, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .builtin
            .keys()
            .map(|t| t.as_str().to_string())
            .chain(self.custom.keys().cloned())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{RetryPolicy, SlotMode};
    use kiln_core::Error;

    fn refuse(_task: &Task, _ctx: &WorkerContext) -> Result<Box<dyn WorkerTask>> {
        Err(Error::InvalidInput("not built in tests".into()))
    }

    fn release_once() -> TaskPolicy {
        TaskPolicy {
            retry: RetryPolicy::once(),
            slot: SlotMode::Release,
        }
    }

    #[test]
    fn test_builtin_table_covers_every_type() {
        let registry = WorkerRegistry::builtin(&EngineConfig::default());
        for task_type in TaskType::ALL {
            assert!(registry.resolve(task_type.as_str()).is_some());
        }
        // Underscore spelling resolves to the same entry.
        let policy = registry.resolve("build_from_image").unwrap().policy;
        assert_eq!(policy.retry.max_attempts, 2);
        assert!(registry.resolve("export-app").is_none());
        assert_eq!(registry.names().len(), TaskType::ALL.len());
    }

    #[test]
    fn test_register_custom_worker() {
        let mut registry = WorkerRegistry::builtin(&EngineConfig::default());
        registry.register("export-app", release_once(), refuse).unwrap();

        let entry = registry.resolve("export-app").unwrap();
        assert_eq!(entry.policy.slot, SlotMode::Release);
        assert!(registry.names().contains(&"export-app".to_string()));
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let mut registry = WorkerRegistry::empty();
        assert!(matches!(
            registry.register("  ", release_once(), refuse),
            Err(SchedulerError::EmptyName)
        ));
        assert!(matches!(
            registry.register("image-share", release_once(), refuse),
            Err(SchedulerError::ReservedName(_))
        ));
        registry.register("export-app", release_once(), refuse).unwrap();
        assert!(matches!(
            registry.register("export-app", release_once(), refuse),
            Err(SchedulerError::DuplicateWorker(_))
        ));
        assert!(matches!(
            registry.register(
                "import-app",
                TaskPolicy {
                    retry: RetryPolicy::attempts(0),
                    slot: SlotMode::Hold,
                },
                refuse
            ),
            Err(SchedulerError::InvalidPolicy(_))
        ));
    }
}
