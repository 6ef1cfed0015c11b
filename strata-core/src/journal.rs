//! Durable task and queue journal.
//!
//! One JSON object per line. Every task creation and state transition is
//! appended; transitions into `pending_merge`, `merged`, `failed` and
//! `abandoned` are synced before the foreman moves on, which is the minimum a
//! restart needs to tell mergeable work from work that must be redone.
//! Sources still queued at shutdown are written as a `deferred` entry.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_model::{EventSource, RunId, TaskId, TaskState};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Opened {
        run: RunId,
        at: DateTime<Utc>,
    },
    Created {
        task_id: TaskId,
        attempt: u32,
        sources: Vec<EventSource>,
        /// Deferred batch the sources were taken from, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deferred_batch: Option<u64>,
        at: DateTime<Utc>,
    },
    Transition {
        task_id: TaskId,
        attempt: u32,
        from: TaskState,
        to: TaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        at: DateTime<Utc>,
    },
    Deferred {
        batch: u64,
        sources: Vec<EventSource>,
        at: DateTime<Utc>,
    },
}

fn must_sync(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::PendingMerge
            | TaskState::Merged
            | TaskState::Failed
            | TaskState::Abandoned
    )
}

/// Append handle on the journal file.
#[derive(Debug)]
pub struct TaskJournal {
    path: PathBuf,
    file: File,
    next_batch: u64,
}

impl TaskJournal {
    /// Opens (or creates) the journal for appending and records the start of
    /// run `run`.
    pub fn open(path: impl Into<PathBuf>, run: RunId) -> Result<Self> {
        let path = path.into();
        let recovered = replay(&path)?;
        if let Some(parent) =
            path.parent().filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        // Appending after a torn line would glue the next entry onto it.
        let file_len = file.metadata()?.len();
        if file_len > recovered.valid_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - recovered.valid_len,
                "truncating torn journal tail"
            );
            file.set_len(recovered.valid_len)?;
        }
        if recovered.unterminated {
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
        let next_batch = recovered.next_batch;

        let mut journal = Self {
            path,
            file,
            next_batch,
        };
        journal.append(
            &JournalEntry::Opened {
                run,
                at: Utc::now(),
            },
            true,
        )?;
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, entry: &JournalEntry, sync: bool) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn record_created(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        sources: &[EventSource],
        deferred_batch: Option<u64>,
    ) -> Result<()> {
        self.append(
            &JournalEntry::Created {
                task_id,
                attempt,
                sources: sources.to_vec(),
                deferred_batch,
                at: Utc::now(),
            },
            false,
        )
    }

    pub fn record_transition(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        from: TaskState,
        to: TaskState,
        note: Option<&str>,
    ) -> Result<()> {
        self.append(
            &JournalEntry::Transition {
                task_id,
                attempt,
                from,
                to,
                note: note.map(str::to_string),
                at: Utc::now(),
            },
            must_sync(to),
        )
    }

    /// Persists unclaimed sources for a later resume. Returns the batch id.
    pub fn record_deferred(&mut self, sources: &[EventSource]) -> Result<u64> {
        let batch = self.next_batch;
        self.append(
            &JournalEntry::Deferred {
                batch,
                sources: sources.to_vec(),
                at: Utc::now(),
            },
            true,
        )?;
        self.next_batch += 1;
        Ok(batch)
    }
}

/// A task as last recorded in the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTask {
    pub id: TaskId,
    pub attempt: u32,
    pub state: TaskState,
    pub sources: Vec<EventSource>,
    pub notes: Vec<String>,
}

/// Everything a restart needs from a previous run's journal.
#[derive(Debug, Clone, Default)]
pub struct RecoveredRun {
    pub tasks: BTreeMap<TaskId, RecoveredTask>,
    /// Deferred batches no task was created from yet, in batch order.
    pub deferred: BTreeMap<u64, Vec<EventSource>>,
    pub next_task_id: Option<TaskId>,
    pub runs: Vec<RunId>,
    next_batch: u64,
    /// Byte length of the intact prefix of the file.
    valid_len: u64,
    /// The last intact entry is missing its line terminator.
    unterminated: bool,
}

impl RecoveredRun {
    pub fn next_task_id(&self) -> TaskId {
        self.next_task_id.unwrap_or(TaskId::FIRST)
    }
}

/// Rebuilds run state from a journal file. A missing file is an empty run.
/// A torn final line is ignored; a damaged line anywhere else is fatal.
pub fn replay(path: &Path) -> Result<RecoveredRun> {
    let mut run = RecoveredRun::default();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(run);
        }
        Err(err) => return Err(err.into()),
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut line_number = 0usize;
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_number += 1;

        let entry = match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entry,
            Err(err) if !line.ends_with('\n') => {
                warn!(
                    path = %path.display(),
                    line = line_number,
                    error = %err,
                    "ignoring torn journal tail"
                );
                break;
            }
            Err(err) => {
                return Err(CoreError::JournalCorrupt {
                    path: path.to_path_buf(),
                    line: line_number,
                    reason: err.to_string(),
                });
            }
        };
        run.valid_len += read as u64;
        run.unterminated = !line.ends_with('\n');
        apply(&mut run, entry);
    }

    debug!(
        path = %path.display(),
        tasks = run.tasks.len(),
        deferred_batches = run.deferred.len(),
        "journal replayed"
    );
    Ok(run)
}

fn apply(run: &mut RecoveredRun, entry: JournalEntry) {
    match entry {
        JournalEntry::Opened { run: id, .. } => run.runs.push(id),
        JournalEntry::Created {
            task_id,
            attempt,
            sources,
            deferred_batch,
            ..
        } => {
            if let Some(batch) = deferred_batch {
                run.deferred.remove(&batch);
            }
            let notes = run
                .tasks
                .remove(&task_id)
                .map(|task| task.notes)
                .unwrap_or_default();
            run.tasks.insert(
                task_id,
                RecoveredTask {
                    id: task_id,
                    attempt,
                    state: TaskState::Created,
                    sources,
                    notes,
                },
            );
            let next = task_id.next();
            if run.next_task_id.is_none_or(|current| current < next) {
                run.next_task_id = Some(next);
            }
        }
        JournalEntry::Transition {
            task_id,
            attempt,
            to,
            note,
            ..
        } => {
            if let Some(task) = run.tasks.get_mut(&task_id) {
                task.attempt = attempt;
                task.state = to;
                if let Some(note) = note {
                    task.notes.push(note);
                }
            }
        }
        JournalEntry::Deferred { batch, sources, .. } => {
            run.deferred.insert(batch, sources);
            run.next_batch = run.next_batch.max(batch + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> EventSource {
        EventSource::file(format!("/evidence/{name}"))
    }

    #[test]
    fn replay_reconstructs_last_known_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal
                .record_created(TaskId(1), 1, &[source("a")], None)
                .unwrap();
            journal
                .record_created(TaskId(2), 1, &[source("b")], None)
                .unwrap();
            for (from, to) in [
                (TaskState::Created, TaskState::Scheduled),
                (TaskState::Scheduled, TaskState::Processing),
                (TaskState::Processing, TaskState::Processed),
                (TaskState::Processed, TaskState::PendingMerge),
            ] {
                journal
                    .record_transition(TaskId(1), 1, from, to, None)
                    .unwrap();
            }
            journal
                .record_transition(
                    TaskId(2),
                    1,
                    TaskState::Created,
                    TaskState::Scheduled,
                    None,
                )
                .unwrap();
            journal
                .record_transition(
                    TaskId(2),
                    1,
                    TaskState::Scheduled,
                    TaskState::Abandoned,
                    Some("worker w0.0 stopped responding"),
                )
                .unwrap();
            journal
                .record_transition(
                    TaskId(2),
                    2,
                    TaskState::Abandoned,
                    TaskState::Created,
                    None,
                )
                .unwrap();
            journal.record_deferred(&[source("c")]).unwrap();
        }

        let run = replay(&path).unwrap();
        assert_eq!(run.runs.len(), 1);
        assert_eq!(run.next_task_id(), TaskId(3));
        assert_eq!(run.tasks[&TaskId(1)].state, TaskState::PendingMerge);

        let retried = &run.tasks[&TaskId(2)];
        assert_eq!(retried.state, TaskState::Created);
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.notes, vec!["worker w0.0 stopped responding"]);

        assert_eq!(run.deferred.get(&0), Some(&vec![source("c")]));
    }

    #[test]
    fn deferred_batches_are_consumed_by_created_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal.record_deferred(&[source("a")]).unwrap();
        }
        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal
                .record_created(TaskId(1), 1, &[source("a")], Some(0))
                .unwrap();
            // Batch ids keep counting across runs.
            assert_eq!(journal.record_deferred(&[source("z")]).unwrap(), 1);
        }

        let run = replay(&path).unwrap();
        assert_eq!(run.runs.len(), 2);
        assert_eq!(run.deferred.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn torn_tail_is_tolerated_but_damage_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal
                .record_created(TaskId(1), 1, &[source("a")], None)
                .unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str(r#"{"kind":"transi"#);
        std::fs::write(&path, &contents).unwrap();
        assert_eq!(replay(&path).unwrap().tasks.len(), 1);

        std::fs::write(&path, format!("oops\n{contents}")).unwrap();
        assert!(matches!(
            replay(&path),
            Err(CoreError::JournalCorrupt { line: 1, .. })
        ));
    }

    #[test]
    fn reopening_after_a_torn_tail_keeps_the_journal_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal
                .record_created(TaskId(1), 1, &[source("a")], None)
                .unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str(r#"{"kind":"transi"#);
        std::fs::write(&path, &contents).unwrap();

        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal
                .record_transition(
                    TaskId(1),
                    1,
                    TaskState::Created,
                    TaskState::Scheduled,
                    None,
                )
                .unwrap();
        }
        // A third run must still be able to replay and append.
        TaskJournal::open(&path, RunId::new()).unwrap();

        let run = replay(&path).unwrap();
        assert_eq!(run.runs.len(), 3);
        assert_eq!(run.tasks[&TaskId(1)].state, TaskState::Scheduled);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("transi{"));
    }

    #[test]
    fn unterminated_final_entry_is_kept_and_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let mut journal = TaskJournal::open(&path, RunId::new()).unwrap();
            journal
                .record_created(TaskId(1), 1, &[source("a")], None)
                .unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.trim_end_matches('\n')).unwrap();

        TaskJournal::open(&path, RunId::new()).unwrap();
        let run = replay(&path).unwrap();
        assert_eq!(run.runs.len(), 2);
        assert_eq!(run.tasks.len(), 1);
    }

    #[test]
    fn missing_journal_is_an_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let run = replay(&dir.path().join("absent")).unwrap();
        assert!(run.tasks.is_empty());
        assert_eq!(run.next_task_id(), TaskId::FIRST);
    }
}
