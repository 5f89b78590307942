//! Engine counters and introspection snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::TaskId;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub shed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub panicked: AtomicU64,
    pub drained: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// A task the engine is running right now.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
    /// Current attempt, 0 before the worker starts.
    pub attempt: u32,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub capacity: usize,
    pub available_slots: usize,
    /// Tasks admitted for execution.
    pub submitted: u64,
    /// Tasks handed back because every slot was busy.
    pub shed: u64,
    pub succeeded: u64,
    /// Terminal failures, panics included.
    pub failed: u64,
    pub panicked: u64,
    /// In-flight tasks handed back on shutdown.
    pub drained: u64,
    pub running: Vec<RunningTask>,
}

impl EngineStats {
    pub(crate) fn new(
        counters: &Counters,
        capacity: usize,
        available_slots: usize,
        mut running: Vec<RunningTask>,
    ) -> Self {
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Self {
            capacity,
            available_slots,
            submitted: Counters::get(&counters.submitted),
            shed: Counters::get(&counters.shed),
            succeeded: Counters::get(&counters.succeeded),
            failed: Counters::get(&counters.failed),
            panicked: Counters::get(&counters.panicked),
            drained: Counters::get(&counters.drained),
            running,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }
}
