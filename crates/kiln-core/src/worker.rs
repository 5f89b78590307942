//! The capability every dispatched handler implements.

use async_trait::async_trait;
use std::time::Duration;

use crate::{Error, EventLogger, Result};

/// A unit of work the engine runs, retries and isolates.
#[async_trait]
pub trait WorkerTask: Send + Sync {
    /// Short name for operator logs.
    fn name(&self) -> &str;

    /// Event logger for user-facing lines.
    fn logger(&self) -> &EventLogger;

    /// Run one attempt. `timeout` is the overall budget of the task.
    async fn run(&self, timeout: Duration) -> Result<()>;

    /// Stop in-progress work. Called on engine shutdown.
    async fn stop(&self) -> Result<()>;

    /// Called once when the task fails terminally.
    async fn on_error(&self, err: &Error);
}
