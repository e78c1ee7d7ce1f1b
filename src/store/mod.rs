//! Durable task catalog.
//!
//! Two interchangeable backends satisfy the same contract: [`MemoryStore`]
//! keeps the live generation in memory, [`SqliteStore`] persists one row
//! per task. All state transitions are compare-and-swap: a writer names the
//! state it expects and receives a conflict error if another writer got
//! there first. Terminal states are immutable.

mod memory;
mod sqlite;
mod task;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use task::{NewTask, Requeued, Task, TaskFilter, TaskPatch, TaskState};

/// Per-state counts used for reporting and drain logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub new: u64,
    pub ready: u64,
    pub assigned: u64,
    pub done: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl StateCounts {
    pub fn unfinished(&self) -> u64 {
        self.new + self.ready + self.assigned
    }

    pub fn total(&self) -> u64 {
        self.unfinished() + self.done + self.failed + self.abandoned
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task in NEW. Returns only after the task is durably
    /// persisted. Idempotent by the task uuid: re-inserting an existing
    /// uuid returns the stored record unchanged.
    async fn insert(&self, task: NewTask) -> Result<Task>;

    /// Current snapshot of a task, or None.
    async fn get(&self, id: i64) -> Result<Option<Task>>;

    /// Compare-and-swap state transition with field updates. Returns the
    /// updated snapshot, or a conflict error naming the actual state.
    async fn update_state(
        &self,
        id: i64,
        from: TaskState,
        to: TaskState,
        patch: TaskPatch,
    ) -> Result<Task>;

    /// Oldest NEW tasks become READY, FIFO by submit time (tie-break on
    /// id). Returns the promoted tasks.
    async fn promote_new(&self, limit: usize) -> Result<Vec<Task>>;

    /// Oldest READY tasks become ASSIGNED to `host`, FIFO by submit time
    /// (tie-break on id). Used to recover dispatchable work in bulk.
    async fn next_ready(&self, limit: usize, host: &str) -> Result<Vec<Task>>;

    /// ASSIGNED → READY with `attempt` incremented, or → ABANDONED when
    /// `attempt` already reached `max_attempts`.
    async fn requeue(&self, id: i64, max_attempts: u32) -> Result<Requeued>;

    /// Read-only projection, FIFO by submit time.
    async fn query(&self, filter: TaskFilter) -> Result<Vec<Task>>;

    /// Per-state counts.
    async fn counts(&self) -> Result<StateCounts>;

    /// Crash recovery: any task left ASSIGNED returns to READY (attempt is
    /// preserved; the lease it held died with the process). Returns the
    /// number of recovered tasks.
    async fn recover(&self) -> Result<u64>;
}

/// Timestamps travel as integer nanoseconds in the durable store.
pub(crate) fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}
