//! Ordered, idempotent transfer of task segments into the output store.
//!
//! The engine only ever looks at the lowest-id live task. Nothing behind it
//! is merged until it is finalised, so store order is task-creation order
//! regardless of which worker finished first. A task leaves the table only
//! after its commit is durable, and the store refuses a second commit for
//! the same task, so re-running a merge after a restart cannot duplicate
//! records.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use strata_model::{Record, TaskId, TaskOutcome, TaskState};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{CoreError, Result},
    journal::TaskJournal,
    segment::{SegmentDir, read_segment},
    store::OutputStore,
    task::{Task, TaskTable},
};

/// What one merge pass finalised.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub records: u64,
    pub duplicates_dropped: u64,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty() && self.failed.is_empty()
    }

    fn absorb(&mut self, other: MergeReport) {
        self.merged.extend(other.merged);
        self.failed.extend(other.failed);
        self.records += other.records;
        self.duplicates_dropped += other.duplicates_dropped;
    }
}

#[derive(Debug)]
pub struct MergeEngine<S> {
    store: S,
}

fn record_digest(record: &Record) -> Result<[u8; 32]> {
    let encoded = serde_json::to_vec(record)?;
    Ok(Sha256::digest(&encoded).into())
}

fn journal_transition(
    journal: &mut Option<&mut TaskJournal>,
    task: &Task,
    from: TaskState,
    note: Option<&str>,
) -> Result<()> {
    match journal {
        Some(journal) => journal.record_transition(
            task.id(),
            task.attempt(),
            from,
            task.state(),
            note,
        ),
        None => Ok(()),
    }
}

impl<S: OutputStore> MergeEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Merges every task at the front of the table that is ready, in id
    /// order, and stops at the first one that is not.
    pub fn merge_ready_tasks(
        &mut self,
        tasks: &mut TaskTable,
        segments: &SegmentDir,
        mut journal: Option<&mut TaskJournal>,
    ) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        while let Some(task) = tasks.first_mut() {
            let id = task.id();
            match task.state() {
                TaskState::PendingMerge => {
                    self.merge_task(task, segments, &mut journal, &mut report)?;
                }
                TaskState::Failed => {
                    // Retries exhausted; the transition was journaled when it
                    // happened.
                    if !self.store.is_committed(id) {
                        let warnings = recovery_warnings(
                            task,
                            "task failed after exhausting its retries",
                        );
                        report.records +=
                            self.commit(id, TaskOutcome::Failed, warnings)?;
                    }
                    report.failed.push(id);
                }
                _ => break,
            }
            tasks.remove(id);
        }

        if !report.is_empty() {
            debug!(
                target: "strata::merge",
                merged = report.merged.len(),
                failed = report.failed.len(),
                records = report.records,
                "merge pass finished"
            );
        }
        Ok(report)
    }

    /// Final pass when no journal exists to carry unfinished work into a
    /// later run: tasks that never got a sealed segment are finalised as
    /// failed with a recovery warning so the store shows what was skipped.
    pub fn finish_incomplete(
        &mut self,
        tasks: &mut TaskTable,
        segments: &SegmentDir,
        reason: &str,
    ) -> Result<MergeReport> {
        let mut report = self.merge_ready_tasks(tasks, segments, None)?;
        while let Some(task) = tasks.first_mut() {
            let id = task.id();
            warn!(
                target: "strata::merge",
                task = %id,
                state = %task.state(),
                "task incomplete at end of run"
            );
            if !self.store.is_committed(id) {
                let mut warnings = recovery_warnings(task, reason);
                let message = format!(
                    "{reason}; {} sources not processed",
                    task.sources().len()
                );
                warnings.push(
                    Record::recovery_warning(id, message)
                        .with_attribute("state", task.state().as_str()),
                );
                report.records +=
                    self.commit(id, TaskOutcome::Failed, warnings)?;
            }
            segments.discard(id, task.attempt());
            report.failed.push(id);
            tasks.remove(id);
            report.absorb(self.merge_ready_tasks(tasks, segments, None)?);
        }
        Ok(report)
    }

    fn merge_task(
        &mut self,
        task: &mut Task,
        segments: &SegmentDir,
        journal: &mut Option<&mut TaskJournal>,
        report: &mut MergeReport,
    ) -> Result<()> {
        let id = task.id();
        let attempt = task.attempt();
        let from = task.transition(TaskState::Merging)?;
        journal_transition(journal, task, from, None)?;

        if self.store.is_committed(id) {
            // Committed before a restart, but the journal never saw MERGED.
            info!(
                target: "strata::merge",
                task = %id,
                "already committed; skipping"
            );
            let from = task.transition(TaskState::Merged)?;
            journal_transition(journal, task, from, Some("already committed"))?;
            segments.discard(id, attempt);
            report.merged.push(id);
            return Ok(());
        }

        let path = segments.path_for(id, attempt);
        match read_segment(&path) {
            Ok(records) => {
                let mut batch =
                    recovery_warnings(task, "earlier attempt abandoned");
                let mut seen = HashSet::with_capacity(records.len());
                for mut record in records {
                    record.task_id = Some(id);
                    let digest = record_digest(&record)?;
                    if seen.insert(digest) {
                        batch.push(record);
                    } else {
                        trace!(
                            target: "strata::merge",
                            task = %id,
                            digest = %hex::encode(digest),
                            "dropping duplicate record"
                        );
                        report.duplicates_dropped += 1;
                    }
                }

                report.records +=
                    self.commit(id, TaskOutcome::Merged, batch)?;
                let from = task.transition(TaskState::Merged)?;
                journal_transition(journal, task, from, None)?;
                report.merged.push(id);
            }
            Err(err) => {
                warn!(
                    target: "strata::merge",
                    task = %id,
                    error = %err,
                    "segment unreadable; failing task"
                );
                let mut batch =
                    recovery_warnings(task, "earlier attempt abandoned");
                let message = format!("task output could not be merged: {err}");
                batch.push(Record::recovery_warning(id, message).with_attribute(
                    "segment",
                    path.to_string_lossy().into_owned(),
                ));
                report.records +=
                    self.commit(id, TaskOutcome::Failed, batch)?;
                let from = task.transition(TaskState::Failed)?;
                let note = err.to_string();
                journal_transition(journal, task, from, Some(&note))?;
                report.failed.push(id);
            }
        }

        segments.discard(id, attempt);
        Ok(())
    }

    fn commit(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        records: Vec<Record>,
    ) -> Result<u64> {
        match self.store.commit_task(task, outcome, records) {
            Ok(range) => {
                debug!(
                    target: "strata::merge",
                    task = %task,
                    ?outcome,
                    first = range.start,
                    records = range.end - range.start,
                    "committed"
                );
                Ok(range.end - range.start)
            }
            Err(CoreError::AlreadyMerged(task)) => {
                info!(
                    target: "strata::merge",
                    task = %task,
                    "store already holds task; nothing appended"
                );
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }
}

/// One recovery warning per note left by abandoned attempts, or a single
/// warning with `fallback` for a failed task without notes.
fn recovery_warnings(task: &Task, fallback: &str) -> Vec<Record> {
    let mut warnings: Vec<Record> = task
        .notes()
        .iter()
        .map(|note| {
            Record::recovery_warning(task.id(), note.clone())
                .with_attribute("attempts", i64::from(task.attempt()))
        })
        .collect();
    if warnings.is_empty() && task.state() == TaskState::Failed {
        warnings.push(Record::recovery_warning(task.id(), fallback));
    }
    warnings
}
