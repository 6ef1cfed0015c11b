use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle.
///
/// ```text
/// CREATED -> SCHEDULED -> PROCESSING -> PROCESSED -> PENDING_MERGE
///              |              |                         |
///              +--------------+-----> ABANDONED <-------+
///                                        |
///                                        +-> CREATED (re-queued)
///                                        +-> FAILED (retries exhausted)
///
/// PENDING_MERGE -> MERGING -> MERGED
///                     |
///                     +-> FAILED (segment unreadable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Scheduled,
    Processing,
    Processed,
    PendingMerge,
    Merging,
    Merged,
    Abandoned,
    Failed,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Scheduled)
                | (Scheduled, Processing)
                | (Processing, Processed)
                | (Processed, PendingMerge)
                | (PendingMerge, Merging)
                | (Merging, Merged)
                | (Merging, Failed)
                | (Scheduled, Abandoned)
                | (Processing, Abandoned)
                | (PendingMerge, Abandoned)
                | (Abandoned, Created)
                | (Abandoned, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Merged | TaskState::Failed)
    }

    /// States in which a worker is (or was last) responsible for the task,
    /// and from which the task can be abandoned.
    pub fn is_supervised(self) -> bool {
        matches!(
            self,
            TaskState::Scheduled
                | TaskState::Processing
                | TaskState::PendingMerge
        )
    }

    /// Still waiting on a worker to finish parsing.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Scheduled => "scheduled",
            TaskState::Processing => "processing",
            TaskState::Processed => "processed",
            TaskState::PendingMerge => "pending_merge",
            TaskState::Merging => "merging",
            TaskState::Merged => "merged",
            TaskState::Abandoned => "abandoned",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task left the engine. Recorded next to its records in the output
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Merged,
    Failed,
}

impl From<TaskOutcome> for TaskState {
    fn from(value: TaskOutcome) -> Self {
        match value {
            TaskOutcome::Merged => TaskState::Merged,
            TaskOutcome::Failed => TaskState::Failed,
        }
    }
}
