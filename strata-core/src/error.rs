use std::path::PathBuf;

use strata_model::{ModelError, TaskId, TaskState, WorkerId};
use thiserror::Error;

/// Engine-level errors.
///
/// Per-source, per-task and per-segment failures are contained inside the
/// engine and surface as warning records; whatever reaches a caller through
/// this type means the run itself cannot continue (queue or output store
/// unusable, durable state corrupt) or an API was misused.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("source queue is closed")]
    QueueClosed,

    #[error("no idle worker available")]
    NoIdleWorker,

    #[error("a task needs at least one event source")]
    EmptyTask,

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("task {0} is already committed to the output store")]
    AlreadyMerged(TaskId),

    #[error("output store {path} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("task journal {path} is corrupt at line {line}: {reason}")]
    JournalCorrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("worker {worker} is unavailable: {reason}")]
    WorkerUnavailable { worker: WorkerId, reason: String },

    #[error("parser already registered for format {0:?}")]
    DuplicateParser(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Why a task output segment could not be read back.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("segment {path} is missing")]
    Missing { path: PathBuf },

    #[error("segment {path} is truncated (no seal after {records} records)")]
    Truncated { path: PathBuf, records: u64 },

    #[error("segment {path} is corrupt at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("segment {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
