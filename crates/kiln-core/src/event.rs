//! User-facing event log.
//!
//! Every task writes step/status-tagged lines keyed by its event id. These
//! lines are what tenants see in the build log viewer, so they carry short
//! human-readable messages only. Operator detail goes to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Step name of the single terminal line every task writes.
pub const TERMINAL_STEP: &str = "last";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Starting,
    Running,
    Success,
    Failure,
    Warning,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Starting => "starting",
            EventStatus::Running => "running",
            EventStatus::Success => "success",
            EventStatus::Failure => "failure",
            EventStatus::Warning => "warning",
        }
    }
}

/// One line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLine {
    pub event_id: String,
    pub level: EventLevel,
    pub step: String,
    pub status: EventStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl EventLine {
    pub fn is_terminal(&self) -> bool {
        self.step == TERMINAL_STEP
    }
}

/// Destination for event log lines.
pub trait EventSink: Send + Sync {
    fn write(&self, line: EventLine);
}

/// Event logger bound to one event id.
#[derive(Clone)]
pub struct EventLogger {
    event_id: String,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("event_id", &self.event_id)
            .finish()
    }
}

impl EventLogger {
    pub fn new(event_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            event_id: event_id.into(),
            sink,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    fn write(&self, level: EventLevel, message: String, step: &str, status: EventStatus) {
        self.sink.write(EventLine {
            event_id: self.event_id.clone(),
            level,
            step: step.to_string(),
            status,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>, step: &str, status: EventStatus) {
        self.write(EventLevel::Info, message.into(), step, status);
    }

    pub fn debug(&self, message: impl Into<String>, step: &str) {
        self.write(EventLevel::Debug, message.into(), step, EventStatus::Running);
    }

    pub fn error(&self, message: impl Into<String>, step: &str) {
        self.write(EventLevel::Error, message.into(), step, EventStatus::Failure);
    }

    pub fn warn(&self, message: impl Into<String>, step: &str) {
        self.write(EventLevel::Info, message.into(), step, EventStatus::Warning);
    }

    /// Terminal success line. Written once per task by the engine.
    pub fn finish_success(&self, message: impl Into<String>) {
        self.write(
            EventLevel::Info,
            message.into(),
            TERMINAL_STEP,
            EventStatus::Success,
        );
    }

    /// Terminal failure line. Written once per task by the engine.
    pub fn finish_failure(&self, message: impl Into<String>) {
        self.write(
            EventLevel::Error,
            message.into(),
            TERMINAL_STEP,
            EventStatus::Failure,
        );
    }
}

/// Sink that forwards event lines to `tracing` under the `kiln::event` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn write(&self, line: EventLine) {
        match line.level {
            EventLevel::Error => tracing::error!(
                target: "kiln::event",
                event_id = %line.event_id,
                step = %line.step,
                status = line.status.as_str(),
                "{}",
                line.message
            ),
            EventLevel::Info => tracing::info!(
                target: "kiln::event",
                event_id = %line.event_id,
                step = %line.step,
                status = line.status.as_str(),
                "{}",
                line.message
            ),
            EventLevel::Debug => tracing::debug!(
                target: "kiln::event",
                event_id = %line.event_id,
                step = %line.step,
                status = line.status.as_str(),
                "{}",
                line.message
            ),
        }
    }
}

/// Sink that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    lines: Mutex<Vec<EventLine>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<EventLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn lines_for(&self, event_id: &str) -> Vec<EventLine> {
        self.lines()
            .into_iter()
            .filter(|l| l.event_id == event_id)
            .collect()
    }

    pub fn terminal_lines(&self, event_id: &str) -> Vec<EventLine> {
        self.lines_for(event_id)
            .into_iter()
            .filter(|l| l.is_terminal())
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn write(&self, line: EventLine) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}
