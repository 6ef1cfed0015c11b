//! Collection walk over a mounted directory tree.

use std::path::{Path, PathBuf};

use strata_model::EventSource;
use tokio::fs;
use tracing::{debug, warn};

use crate::{error::Result, queue::SourceQueue};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    pub sources: u64,
    /// Entries that could not be listed or inspected.
    pub skipped: u64,
}

/// Enqueues every regular file under `root` as an [`EventSource`].
///
/// Entries are visited in name order so the same tree always yields the same
/// queue order, and therefore the same task layout. Unreadable entries are
/// logged and skipped. Symlinks are not followed. Each enqueue may wait for
/// queue capacity, which is how the walk is throttled by the worker pool.
pub async fn collect_directory<Q>(root: &Path, queue: &Q) -> Result<WalkSummary>
where
    Q: SourceQueue + ?Sized,
{
    let mut summary = WalkSummary::default();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                summary.skipped += 1;
                warn!(
                    target: "strata::walk",
                    path = %dir.display(),
                    error = %err,
                    "skipping unreadable directory"
                );
                continue;
            }
        };

        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    summary.skipped += 1;
                    warn!(
                        target: "strata::walk",
                        path = %dir.display(),
                        error = %err,
                        "directory listing cut short"
                    );
                    break;
                }
            };
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => subdirs.push(path),
                Ok(kind) if kind.is_file() => {
                    let size =
                        entry.metadata().await.ok().map(|meta| meta.len());
                    files.push((path, size));
                }
                Ok(_) => debug!(
                    target: "strata::walk",
                    path = %path.display(),
                    "skipping non-regular entry"
                ),
                Err(err) => {
                    summary.skipped += 1;
                    warn!(
                        target: "strata::walk",
                        path = %path.display(),
                        error = %err,
                        "skipping entry due to metadata error"
                    );
                }
            }
        }

        files.sort();
        for (path, size) in files {
            let mut source = EventSource::file(path);
            if let Some(size) = size {
                source = source.with_size(size);
            }
            queue.enqueue(source).await?;
            summary.sources += 1;
        }

        // Reverse so the stack pops subdirectories in name order.
        subdirs.sort();
        pending.extend(subdirs.into_iter().rev());
    }

    debug!(
        target: "strata::walk",
        root = %root.display(),
        sources = summary.sources,
        skipped = summary.skipped,
        "walk finished"
    );
    Ok(summary)
}
