//! Per-task output segments.
//!
//! Each (task, attempt) pair gets its own append-only JSON-lines file. A
//! worker appends records while parsing and writes a seal entry carrying the
//! record count once it is done. The merge engine only trusts sealed
//! segments; a missing seal means the writer died mid-task.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use strata_model::{Record, TaskId};
use tracing::{debug, warn};

use crate::error::{Result, SegmentError};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SegmentEntry {
    Record { record: Record },
    Seal { records: u64 },
}

/// Directory holding all segments of one output store.
#[derive(Debug, Clone)]
pub struct SegmentDir {
    root: PathBuf,
}

impl SegmentDir {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Attempts never share a file, so a late writer from an abandoned
    /// attempt cannot touch the segment of its replacement.
    pub fn path_for(&self, task: TaskId, attempt: u32) -> PathBuf {
        self.root
            .join(format!("task-{:010}-{attempt}.seg", task.get()))
    }

    /// Removes a segment. A segment that is already gone is not an error.
    pub fn discard(&self, task: TaskId, attempt: u32) {
        let path = self.path_for(task, attempt);
        match fs::remove_file(&path) {
            Ok(()) => debug!(task = %task, attempt, "segment discarded"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "failed to discard segment"
            ),
        }
    }

    /// Deletes every segment file for which `keep` returns `false`. Used on
    /// resume to drop leftovers of attempts that will never be merged.
    pub fn sweep(
        &self,
        mut keep: impl FnMut(TaskId, u32) -> bool,
    ) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((task, attempt)) =
                parse_segment_name(&name.to_string_lossy())
            else {
                continue;
            };
            if !keep(task, attempt) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn parse_segment_name(name: &str) -> Option<(TaskId, u32)> {
    let rest = name.strip_prefix("task-")?.strip_suffix(".seg")?;
    let (task, attempt) = rest.split_once('-')?;
    Some((TaskId(task.parse().ok()?), attempt.parse().ok()?))
}

/// Appends records to one segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: u64,
}

impl SegmentWriter {
    /// Creates the segment. Fails if the file already exists.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn append(&mut self, record: Record) -> Result<()> {
        serde_json::to_writer(&mut self.out, &SegmentEntry::Record { record })?;
        self.out.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    /// Writes the trailer and flushes to disk. Returns the record count.
    pub fn seal(mut self) -> Result<u64> {
        serde_json::to_writer(
            &mut self.out,
            &SegmentEntry::Seal {
                records: self.records,
            },
        )?;
        self.out.write_all(b"\n")?;
        let file = self
            .out
            .into_inner()
            .map_err(|err| err.into_error())?;
        file.sync_data()?;
        Ok(self.records)
    }
}

/// Reads a sealed segment back.
pub fn read_segment(
    path: &Path,
) -> std::result::Result<Vec<Record>, SegmentError> {
    let file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => SegmentError::Missing {
            path: path.to_path_buf(),
        },
        _ => SegmentError::Io {
            path: path.to_path_buf(),
            source: err,
        },
    })?;

    let mut records = Vec::new();
    let mut sealed = false;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut line_number = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|source| SegmentError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        line_number += 1;

        let corrupt = |reason: String| SegmentError::Corrupt {
            path: path.to_path_buf(),
            line: line_number,
            reason,
        };

        if sealed {
            return Err(corrupt("data after seal".into()));
        }
        if !line.ends_with('\n') {
            // Torn final write: the worker died before sealing.
            break;
        }

        match serde_json::from_str::<SegmentEntry>(&line) {
            Ok(SegmentEntry::Record { record }) => records.push(record),
            Ok(SegmentEntry::Seal { records: count }) => {
                if count != records.len() as u64 {
                    return Err(corrupt(format!(
                        "seal claims {count} records, found {}",
                        records.len()
                    )));
                }
                sealed = true;
            }
            Err(err) => return Err(corrupt(err.to_string())),
        }
    }

    if !sealed {
        return Err(SegmentError::Truncated {
            path: path.to_path_buf(),
            records: records.len() as u64,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn record(kind: &str) -> Record {
        Record::of_type(kind).unwrap()
    }

    #[test]
    fn sealed_segment_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let segments = SegmentDir::create(dir.path()).unwrap();
        let path = segments.path_for(TaskId(3), 1);

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(record("test:a")).unwrap();
        writer.append(record("test:b")).unwrap();
        assert_eq!(writer.seal().unwrap(), 2);

        let records = read_segment(&path).unwrap();
        let kinds: Vec<_> =
            records.iter().map(|r| r.data_type.as_str()).collect();
        assert_eq!(kinds, vec!["test:a", "test:b"]);
    }

    #[test]
    fn attempts_get_distinct_files_and_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let segments = SegmentDir::create(dir.path()).unwrap();
        assert_ne!(
            segments.path_for(TaskId(1), 1),
            segments.path_for(TaskId(1), 2)
        );

        let path = segments.path_for(TaskId(1), 1);
        SegmentWriter::create(&path).unwrap().seal().unwrap();
        assert!(SegmentWriter::create(&path).is_err());
    }

    #[test]
    fn missing_seal_is_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.seg");
        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(record("test:a")).unwrap();
        drop(writer);

        assert!(matches!(
            read_segment(&path),
            Err(SegmentError::Truncated { records: 1, .. })
        ));

        // Torn trailing line.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"kind":"rec"#).unwrap();
        assert!(matches!(
            read_segment(&path),
            Err(SegmentError::Truncated { .. })
        ));
    }

    #[test]
    fn garbage_and_count_mismatch_are_corruption() {
        let dir = tempfile::tempdir().unwrap();

        let garbage = dir.path().join("g.seg");
        fs::write(&garbage, "not json\n").unwrap();
        assert!(matches!(
            read_segment(&garbage),
            Err(SegmentError::Corrupt { line: 1, .. })
        ));

        let mismatch = dir.path().join("m.seg");
        fs::write(&mismatch, "{\"kind\":\"seal\",\"records\":4}\n").unwrap();
        assert!(matches!(
            read_segment(&mismatch),
            Err(SegmentError::Corrupt { .. })
        ));

        assert!(matches!(
            read_segment(&dir.path().join("absent.seg")),
            Err(SegmentError::Missing { .. })
        ));
    }

    #[test]
    fn sweep_keeps_only_selected_segments() {
        let dir = tempfile::tempdir().unwrap();
        let segments = SegmentDir::create(dir.path()).unwrap();
        for (task, attempt) in [(1, 1), (1, 2), (2, 1)] {
            SegmentWriter::create(segments.path_for(TaskId(task), attempt))
                .unwrap()
                .seal()
                .unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        let removed = segments
            .sweep(|task, attempt| task == TaskId(1) && attempt == 2)
            .unwrap();
        assert_eq!(removed, 2);
        assert!(segments.path_for(TaskId(1), 2).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
