use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use strata_model::{Record, TaskId, TaskOutcome};

use super::{OutputStore, StoredRecord};
use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<StoredRecord>,
    committed: BTreeMap<TaskId, TaskOutcome>,
}

/// In-memory store. Clones share the same contents, so a clone kept outside
/// the foreman acts as a live reader.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything committed so far, in sequence order.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.read().records.clone()
    }

    /// Records from `sequence` onwards. Repeated calls with an advancing
    /// cursor see a sequence that only ever grows.
    pub fn records_from(&self, sequence: u64) -> Vec<StoredRecord> {
        let state = self.read();
        let start = usize::try_from(sequence)
            .unwrap_or(usize::MAX)
            .min(state.records.len());
        state.records[start..].to_vec()
    }

    pub fn committed_tasks(&self) -> Vec<(TaskId, TaskOutcome)> {
        self.read()
            .committed
            .iter()
            .map(|(task, outcome)| (*task, *outcome))
            .collect()
    }
}

impl OutputStore for MemoryStore {
    fn commit_task(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        records: Vec<Record>,
    ) -> Result<Range<u64>> {
        let mut state = self.write();
        if state.committed.contains_key(&task) {
            return Err(CoreError::AlreadyMerged(task));
        }

        let start = state.records.len() as u64;
        for (offset, record) in records.into_iter().enumerate() {
            state.records.push(StoredRecord {
                sequence: start + offset as u64,
                task_id: task,
                record,
            });
        }
        state.committed.insert(task, outcome);
        Ok(start..state.records.len() as u64)
    }

    fn outcome(&self, task: TaskId) -> Option<TaskOutcome> {
        self.read().committed.get(&task).copied()
    }

    fn len(&self) -> u64 {
        self.read().records.len() as u64
    }
}
