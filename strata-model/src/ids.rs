use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a dispatch unit. Assigned monotonically by the foreman and
/// reused when an abandoned task is re-queued, so creation order is stable
/// across retries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const FIRST: TaskId = TaskId(1);

    pub fn next(self) -> TaskId {
        TaskId(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{:06}", self.0)
    }
}

/// Identity of one worker incarnation.
///
/// `slot` is the pool position and survives replacement; `generation`
/// increments every time the foreman replaces a stalled worker, which lets it
/// discard late reports from a worker it already gave up on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub struct WorkerId {
    pub slot: u16,
    pub generation: u32,
}

impl WorkerId {
    pub fn new(slot: u16, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn successor(self) -> Self {
        Self {
            slot: self.slot,
            generation: self.generation + 1,
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}.{}", self.slot, self.generation)
    }
}

/// Identifier of one foreman run, recorded in the journal so a resumed run
/// can tell its own entries from the interrupted run's.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_order_by_creation() {
        let first = TaskId::FIRST;
        let second = first.next();
        assert!(first < second);
        assert_eq!(second.to_string(), "t000002");
    }

    #[test]
    fn worker_successor_keeps_slot() {
        let worker = WorkerId::new(3, 0);
        let replacement = worker.successor();
        assert_eq!(replacement.slot, 3);
        assert_ne!(worker, replacement);
        assert_eq!(replacement.to_string(), "w3.1");
    }
}
