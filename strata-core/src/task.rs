//! Tasks and the foreman's task table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use strata_model::{EventSource, TaskId, TaskState, WorkerId};

use crate::error::{CoreError, Result};

/// One dispatch unit: a claim on a slice of event sources handed to exactly
/// one worker at a time.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    /// Starts at 1 and increments every time the task is re-queued.
    attempt: u32,
    state: TaskState,
    sources: Vec<EventSource>,
    pub worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    pub merge_started_at: Option<DateTime<Utc>>,
    pub merge_ended_at: Option<DateTime<Utc>>,
    /// Why earlier attempts were abandoned. Surfaced as recovery warnings
    /// when the task is finalised.
    notes: Vec<String>,
}

impl Task {
    pub fn new(id: TaskId, sources: Vec<EventSource>) -> Self {
        Self::restored(id, 1, sources, Vec::new())
    }

    /// A task rebuilt from durable state, waiting to be dispatched again.
    pub fn restored(
        id: TaskId,
        attempt: u32,
        sources: Vec<EventSource>,
        notes: Vec<String>,
    ) -> Self {
        Self {
            id,
            attempt,
            state: TaskState::Created,
            sources,
            worker: None,
            created_at: Utc::now(),
            scheduled_at: None,
            processing_started_at: None,
            processing_ended_at: None,
            merge_started_at: None,
            merge_ended_at: None,
            notes,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn sources(&self) -> &[EventSource] {
        &self.sources
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Moves to `next`, stamping the matching phase time. Returns the state
    /// left behind.
    pub fn transition(&mut self, next: TaskState) -> Result<TaskState> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                task: self.id,
                from,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            TaskState::Scheduled => self.scheduled_at = Some(now),
            TaskState::Processing => self.processing_started_at = Some(now),
            TaskState::Processed => self.processing_ended_at = Some(now),
            TaskState::Merging => self.merge_started_at = Some(now),
            TaskState::Merged | TaskState::Failed => {
                self.merge_ended_at = Some(now)
            }
            TaskState::Created => {
                // Re-queued after abandonment: same id and sources, new
                // attempt.
                self.attempt += 1;
                self.worker = None;
                self.scheduled_at = None;
                self.processing_started_at = None;
                self.processing_ended_at = None;
            }
            TaskState::PendingMerge | TaskState::Abandoned => {}
        }
        self.state = next;
        Ok(from)
    }

    /// Puts a task rebuilt from durable state back into `state` without
    /// walking the lifecycle: `pending_merge` when its sealed segment is on
    /// disk, `failed` when its retries ran out before the restart.
    pub(crate) fn restore_state(&mut self, state: TaskState) {
        self.state = state;
    }
}

/// All live tasks, ordered by id. Finalised tasks are removed once their
/// output has been committed or discarded.
#[derive(Debug)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
    next_id: TaskId,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::starting_at(TaskId::FIRST)
    }
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next_id: TaskId) -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_id,
        }
    }

    /// Allocates the next id and inserts a `created` task.
    pub fn create(&mut self, sources: Vec<EventSource>) -> Result<TaskId> {
        if sources.is_empty() {
            return Err(CoreError::EmptyTask);
        }
        let id = self.next_id;
        self.next_id = id.next();
        self.tasks.insert(id, Task::new(id, sources));
        Ok(id)
    }

    pub fn insert(&mut self, task: Task) {
        if task.id() >= self.next_id {
            self.next_id = task.id().next();
        }
        self.tasks.insert(task.id(), task);
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn require_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(CoreError::UnknownTask(id))
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    /// Lowest-id task still in the table: the merge frontier.
    pub fn first_mut(&mut self) -> Option<&mut Task> {
        self.tasks.values_mut().next()
    }

    /// Lowest-id task waiting for a worker.
    pub fn next_created(&self) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|task| task.state() == TaskState::Created)
            .map(Task::id)
    }

    pub fn has_created(&self) -> bool {
        self.next_created().is_some()
    }

    pub fn ids_where(
        &self,
        mut predicate: impl FnMut(&Task) -> bool,
    ) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| predicate(task))
            .map(Task::id)
            .collect()
    }

    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|task| task.state() == state).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn next_id(&self) -> TaskId {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
