//! The task execution engine.
//!
//! Admission is a counting semaphore sized to the configured maximum of
//! concurrent tasks. A task that finds no free slot is handed back to the
//! upstream message source for redelivery, and the submitting caller is held
//! until a slot frees up, so an overloaded node neither drops nor hot-loops on
//! work. Admitted tasks run on their own tokio task, retried per their task
//! type's policy, with panics caught and turned into terminal failures.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kiln_core::{Error, EventLogger, Result, Task, TaskId, WorkerTask};

use crate::policy::SlotMode;
use crate::registry::{Registration, WorkerRegistry};
use crate::stats::{Counters, EngineStats, RunningTask};
use crate::WorkerContext;

/// What the terminal line says after a panic. Details stay in operator logs.
pub const PANIC_USER_MESSAGE: &str =
    "The task failed unexpectedly, please retry or contact support";

/// Outcome of [`TaskEngine::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The task was admitted and runs on this node.
    Accepted,
    /// Every slot was busy, or the engine is stopping; the task was handed
    /// back for redelivery.
    Shed,
    /// A task with the same id is already running here.
    Duplicate,
}

/// Admission slot. Waking shed callers happens after the permit is returned.
struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    freed: Arc<Notify>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.freed.notify_waiters();
    }
}

struct Running {
    task: Task,
    started_at: chrono::DateTime<Utc>,
    attempt: u32,
    worker: Option<Arc<dyn WorkerTask>>,
    abort: Option<AbortHandle>,
}

struct Inner {
    ctx: WorkerContext,
    registry: WorkerRegistry,
    capacity: usize,
    slots: Arc<Semaphore>,
    slot_freed: Arc<Notify>,
    idle: Notify,
    task_timeout: Duration,
    running: Mutex<HashMap<TaskId, Running>>,
    counters: Counters,
    stopping: AtomicBool,
}

/// Runs tasks with bounded concurrency. Cheap to clone.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

impl TaskEngine {
    pub fn new(ctx: WorkerContext, registry: WorkerRegistry) -> Self {
        let capacity = ctx.config.max_concurrent_tasks.max(1);
        let task_timeout = ctx.config.task_timeout;
        Self {
            inner: Arc::new(Inner {
                ctx,
                registry,
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                slot_freed: Arc::new(Notify::new()),
                idle: Notify::new(),
                task_timeout,
                running: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.inner.ctx
    }

    /// Admit a task, or shed it when every slot is busy.
    ///
    /// A shed task is handed back through the notifier and this call then
    /// waits for a slot to free up before returning. If the hand-back itself
    /// fails the task is run here once a slot frees, so it is never lost.
    pub async fn submit(&self, task: Task) -> Admission {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::SeqCst) {
            inner.hand_back(task, "Engine is stopping, task handed back").await;
            Counters::incr(&inner.counters.shed);
            return Admission::Shed;
        }

        if let Ok(permit) = inner.slots.clone().try_acquire_owned() {
            return inner.dispatch(task, permit);
        }

        let task_id = task.id.clone();
        match inner.ctx.notifier.redeliver(task.clone()).await {
            Ok(()) => {
                Counters::incr(&inner.counters.shed);
                warn!(
                    task_id = %task_id,
                    task_type = %task.task_type,
                    capacity = inner.capacity,
                    "All slots busy, task shed for redelivery"
                );
                inner.wait_for_slot().await;
                Admission::Shed
            }
            Err(e) => {
                error!(
                    task_id = %task_id,
                    error = %e,
                    "Task could not be handed back, running it once a slot frees"
                );
                match inner.slots.clone().acquire_owned().await {
                    Ok(permit) => inner.dispatch(task, permit),
                    Err(_) => {
                        error!(task_id = %task_id, "Admission closed, task dropped");
                        Admission::Shed
                    }
                }
            }
        }
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock_running().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the engine. Every in-flight task is stopped and handed back for
    /// redelivery; later submissions are shed. Returns the number of tasks
    /// handed back.
    pub async fn shutdown(&self) -> usize {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::SeqCst);
        inner.slot_freed.notify_waiters();

        let drained: Vec<Running> = inner.lock_running().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        info!(in_flight = count, "Shutting down task engine");

        for running in drained {
            if let Some(worker) = &running.worker {
                if let Err(e) = worker.stop().await {
                    warn!(task_id = %running.task.id, error = %e, "Worker did not stop cleanly");
                }
            }
            if let Some(abort) = &running.abort {
                abort.abort();
            }
            Counters::incr(&inner.counters.drained);
            inner.hand_back(running.task, "In-flight task handed back").await;
        }
        inner.idle.notify_waiters();
        count
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let running = inner
            .lock_running()
            .values()
            .map(|r| RunningTask {
                task_id: r.task.id.clone(),
                task_type: r.task.task_type.clone(),
                started_at: r.started_at,
                attempt: r.attempt,
            })
            .collect();
        EngineStats::new(
            &inner.counters,
            inner.capacity,
            inner.slots.available_permits(),
            running,
        )
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.inner.lock_running().keys().cloned().collect()
    }
}

impl Inner {
    fn lock_running(&self) -> MutexGuard<'_, HashMap<TaskId, Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn hand_back(&self, task: Task, reason: &str) {
        let task_id = task.id.clone();
        match self.ctx.notifier.redeliver(task).await {
            Ok(()) => info!(task_id = %task_id, "{}", reason),
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to hand task back"),
        }
    }

    /// Wait until a slot is free or the engine stops.
    async fn wait_for_slot(&self) {
        loop {
            let notified = self.slot_freed.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            if self.slots.available_permits() > 0 || self.stopping.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn dispatch(self: &Arc<Self>, task: Task, permit: OwnedSemaphorePermit) -> Admission {
        let slot = Slot {
            permit: Some(permit),
            freed: self.slot_freed.clone(),
        };
        let registration = self.registry.resolve(&task.task_type).cloned();

        let mut running = self.lock_running();
        if running.contains_key(&task.id) {
            warn!(task_id = %task.id, "Task is already running here, ignoring duplicate delivery");
            return Admission::Duplicate;
        }

        Counters::incr(&self.counters.submitted);
        info!(task_id = %task.id, task_type = %task.task_type, "Task admitted");

        let inner = self.clone();
        let run_task = task.clone();
        let handle = tokio::spawn(async move { inner.execute(run_task, registration, slot).await });
        running.insert(
            task.id.clone(),
            Running {
                task,
                started_at: Utc::now(),
                attempt: 0,
                worker: None,
                abort: Some(handle.abort_handle()),
            },
        );
        Admission::Accepted
    }

    async fn execute(&self, task: Task, registration: Option<Registration>, slot: Slot) {
        let Some(registration) = registration else {
            error!(task_id = %task.id, task_type = %task.task_type, "No worker for task type");
            let logger = self.ctx.logger(&task.event_id());
            let err = Error::InvalidInput(format!("unsupported task type: {}", task.task_type));
            self.complete(&task, &logger, None, Err(err)).await;
            return;
        };

        let created = std::panic::catch_unwind(AssertUnwindSafe(|| {
            registration.factory.create(&task, &self.ctx)
        }));
        let worker: Arc<dyn WorkerTask> = match created {
            Ok(Ok(worker)) => Arc::from(worker),
            Ok(Err(err)) => {
                let logger = self.ctx.logger(&task.event_id());
                self.complete(&task, &logger, None, Err(err)).await;
                return;
            }
            Err(panic) => {
                let logger = self.ctx.logger(&task.event_id());
                let err = Error::Panicked(panic_message(panic.as_ref()));
                self.complete(&task, &logger, None, Err(err)).await;
                return;
            }
        };

        if let Some(running) = self.lock_running().get_mut(&task.id) {
            running.worker = Some(worker.clone());
        }

        let mut slot = Some(slot);
        if registration.policy.slot == SlotMode::Release {
            slot.take();
        }

        let result = self.run_with_retry(&task, worker.as_ref(), &registration).await;
        drop(slot);
        self.complete(&task, worker.logger(), Some(worker.as_ref()), result)
            .await;
    }

    async fn run_with_retry(
        &self,
        task: &Task,
        worker: &dyn WorkerTask,
        registration: &Registration,
    ) -> Result<()> {
        let retry = registration.policy.retry;
        let deadline = Instant::now() + self.task_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(running) = self.lock_running().get_mut(&task.id) {
                running.attempt = attempt;
            }
            debug!(task_id = %task.id, worker = worker.name(), attempt, "Running attempt");

            let budget = deadline.saturating_duration_since(Instant::now());
            let err = match run_attempt(worker, budget).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let time_left = deadline.saturating_duration_since(Instant::now()) > retry.pause;
            if !(err.is_retryable() && attempt < retry.max_attempts && time_left) {
                return Err(err);
            }
            warn!(
                task_id = %task.id,
                worker = worker.name(),
                attempt,
                max_attempts = retry.max_attempts,
                error = %err,
                "Attempt failed, retrying"
            );
            worker
                .logger()
                .warn(format!("Attempt {} failed, retrying", attempt), "retry");
            if !retry.pause.is_zero() {
                tokio::time::sleep(retry.pause).await;
            }
        }
    }

    /// Write the single terminal line of a task and update the counters.
    async fn complete(
        &self,
        task: &Task,
        logger: &EventLogger,
        worker: Option<&dyn WorkerTask>,
        result: Result<()>,
    ) {
        if !self.lock_running().contains_key(&task.id) {
            debug!(task_id = %task.id, "Task was handed back on shutdown, dropping its outcome");
            return;
        }

        match result {
            Ok(()) => {
                Counters::incr(&self.counters.succeeded);
                info!(task_id = %task.id, task_type = %task.task_type, "Task succeeded");
                logger.finish_success("The task completed successfully");
            }
            Err(err) => {
                if let Some(worker) = worker {
                    let handled = AssertUnwindSafe(worker.on_error(&err)).catch_unwind().await;
                    if let Err(panic) = handled {
                        error!(
                            task_id = %task.id,
                            panic = %panic_message(panic.as_ref()),
                            "Error handler panicked"
                        );
                    }
                }
                Counters::incr(&self.counters.failed);
                if matches!(err, Error::Panicked(_)) {
                    Counters::incr(&self.counters.panicked);
                }
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %err,
                    "Task failed"
                );
                logger.finish_failure(failure_message(&err));
            }
        }

        // Leave the running map last so `wait_idle` observes the outcome.
        let mut running = self.lock_running();
        running.remove(&task.id);
        if running.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// One attempt within `budget`, with panics caught.
async fn run_attempt(worker: &dyn WorkerTask, budget: Duration) -> Result<()> {
    if budget.is_zero() {
        return Err(Error::Timeout(format!("{} ran out of time", worker.name())));
    }
    match tokio::time::timeout(budget, AssertUnwindSafe(worker.run(budget)).catch_unwind()).await
    {
        Err(_) => Err(Error::Timeout(format!(
            "{} exceeded {}s",
            worker.name(),
            budget.as_secs()
        ))),
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(worker = worker.name(), panic = %message, "Worker panicked");
            Err(Error::Panicked(message))
        }
        Ok(Ok(result)) => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn failure_message(err: &Error) -> &'static str {
    match err {
        Error::Panicked(_) => PANIC_USER_MESSAGE,
        Error::Timeout(_) => "The task timed out, please retry",
        Error::InvalidInput(_) => "The task is invalid and was not run again",
        _ => "The task failed, see the log above for details",
    }
}
