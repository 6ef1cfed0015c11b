use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    ops::Range,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use strata_model::{Record, TaskId, TaskOutcome};
use tracing::{info, warn};

use super::{OutputStore, StoredRecord};
use crate::error::{CoreError, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoreEntry {
    Record(StoredRecord),
    Commit {
        task_id: TaskId,
        outcome: TaskOutcome,
        records: u64,
    },
}

/// Durable JSON-lines output store.
///
/// Record lines for a task are followed by one commit line, and the file is
/// synced before `commit_task` returns. Anything after the last commit line
/// belongs to an interrupted append and is cut off on open.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
    committed: HashMap<TaskId, TaskOutcome>,
    next_sequence: u64,
    committed_len: u64,
}

struct Scan {
    committed: HashMap<TaskId, TaskOutcome>,
    next_sequence: u64,
    committed_len: u64,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) =
            path.parent().filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let scan = scan(&path, &file)?;
        let file_len = file.metadata()?.len();
        if file_len > scan.committed_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - scan.committed_len,
                "truncating uncommitted tail of output store"
            );
            file.set_len(scan.committed_len)?;
            file.sync_data()?;
        }
        info!(
            path = %path.display(),
            tasks = scan.committed.len(),
            records = scan.next_sequence,
            "output store opened"
        );

        Ok(Self {
            path,
            file,
            committed: scan.committed,
            next_sequence: scan.next_sequence,
            committed_len: scan.committed_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A tailing reader over this store's file.
    pub fn reader(&self) -> Result<FileStoreReader> {
        FileStoreReader::open(&self.path)
    }

    fn append(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        records: Vec<Record>,
    ) -> Result<u64> {
        self.file.seek(SeekFrom::Start(self.committed_len))?;
        let mut out = BufWriter::new(&self.file);
        let mut sequence = self.next_sequence;
        let count = records.len() as u64;

        for record in records {
            serde_json::to_writer(
                &mut out,
                &StoreEntry::Record(StoredRecord {
                    sequence,
                    task_id: task,
                    record,
                }),
            )?;
            out.write_all(b"\n")?;
            sequence += 1;
        }
        serde_json::to_writer(
            &mut out,
            &StoreEntry::Commit {
                task_id: task,
                outcome,
                records: count,
            },
        )?;
        out.write_all(b"\n")?;
        out.flush()?;
        drop(out);
        self.file.sync_data()?;
        Ok(sequence)
    }
}

impl OutputStore for FileStore {
    fn commit_task(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        records: Vec<Record>,
    ) -> Result<Range<u64>> {
        if self.committed.contains_key(&task) {
            return Err(CoreError::AlreadyMerged(task));
        }

        let start = self.next_sequence;
        match self.append(task, outcome, records) {
            Ok(end) => {
                self.committed_len = self.file.stream_position()?;
                self.next_sequence = end;
                self.committed.insert(task, outcome);
                Ok(start..end)
            }
            Err(err) => {
                // Leave the file as it was before this commit so later
                // commits do not land behind a partial one.
                if let Err(cleanup) = self.file.set_len(self.committed_len) {
                    warn!(
                        error = %cleanup,
                        "failed to roll back partial commit"
                    );
                }
                Err(err)
            }
        }
    }

    fn outcome(&self, task: TaskId) -> Option<TaskOutcome> {
        self.committed.get(&task).copied()
    }

    fn len(&self) -> u64 {
        self.next_sequence
    }
}

fn scan(path: &Path, file: &File) -> Result<Scan> {
    let corrupt = |reason: String| CoreError::StoreCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut offset = 0u64;
    let mut result = Scan {
        committed: HashMap::new(),
        next_sequence: 0,
        committed_len: 0,
    };
    let mut pending: Vec<StoredRecord> = Vec::new();
    let mut damaged_at: Option<u64> = None;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        offset += read as u64;
        if !line.ends_with('\n') {
            break;
        }

        let entry = match serde_json::from_str::<StoreEntry>(&line) {
            Ok(entry) => entry,
            Err(_) => {
                damaged_at.get_or_insert(offset);
                continue;
            }
        };

        match entry {
            StoreEntry::Record(stored) => {
                let expected = result.next_sequence + pending.len() as u64;
                if damaged_at.is_none() && stored.sequence != expected {
                    return Err(corrupt(format!(
                        "sequence {} where {expected} was expected",
                        stored.sequence
                    )));
                }
                pending.push(stored);
            }
            StoreEntry::Commit {
                task_id,
                outcome,
                records,
            } => {
                if damaged_at.is_some() {
                    return Err(corrupt(
                        "unreadable line before a commit".into(),
                    ));
                }
                if pending.len() as u64 != records
                    || pending.iter().any(|stored| stored.task_id != task_id)
                {
                    return Err(corrupt(format!(
                        "commit for {task_id} does not match its records"
                    )));
                }
                if result.committed.insert(task_id, outcome).is_some() {
                    return Err(corrupt(format!("{task_id} committed twice")));
                }
                result.next_sequence += records;
                result.committed_len = offset;
                pending.clear();
            }
        }
    }

    Ok(result)
}

/// Follows a [`FileStore`] from another handle, exposing committed records
/// only. Each [`poll`](Self::poll) returns what was committed since the last
/// call, so the observed sequence only ever grows.
#[derive(Debug)]
pub struct FileStoreReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    pending: Vec<StoredRecord>,
}

impl FileStoreReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: 0,
            pending: Vec::new(),
        })
    }

    pub fn poll(&mut self) -> Result<Vec<StoredRecord>> {
        let mut out = Vec::new();
        let mut line = String::new();
        self.reader.seek(SeekFrom::Start(self.offset))?;
        let mut position = self.offset;

        loop {
            line.clear();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            position += read as u64;

            match serde_json::from_str::<StoreEntry>(&line) {
                Ok(StoreEntry::Record(stored)) => self.pending.push(stored),
                Ok(StoreEntry::Commit { .. }) => {
                    out.append(&mut self.pending);
                    self.offset = position;
                }
                // Possibly a tail that the writer is about to roll back.
                Err(_) => break,
            }
        }

        // Uncommitted records are re-read on the next poll.
        self.pending.clear();
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
