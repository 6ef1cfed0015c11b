//! The authoritative output store.
//!
//! Append-only and keyed by insertion sequence. Records of one task are
//! committed together, contiguously, after the task has been merged. Once a
//! task is committed the store refuses a second commit for it; that refusal
//! is what makes the merge engine idempotent across restarts.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use strata_model::{Record, TaskId, TaskOutcome};

use crate::error::Result;

mod file;
mod memory;

pub use file::{FileStore, FileStoreReader};
pub use memory::MemoryStore;

/// A record with its final position in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub sequence: u64,
    pub task_id: TaskId,
    pub record: Record,
}

pub trait OutputStore: Send {
    /// Appends `records` for `task` and marks the task finalised with
    /// `outcome`, atomically from a reader's point of view. Returns the
    /// sequence numbers assigned. Fails with `AlreadyMerged` if the task was
    /// committed before.
    fn commit_task(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        records: Vec<Record>,
    ) -> Result<Range<u64>>;

    fn outcome(&self, task: TaskId) -> Option<TaskOutcome>;

    fn is_committed(&self, task: TaskId) -> bool {
        self.outcome(task).is_some()
    }

    /// Number of records committed so far; also the next sequence number.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
