//! # Strata Core
//!
//! Task distribution, worker coordination and ordered result merging for the
//! Strata timeline extractor.
//!
//! ## Overview
//!
//! A collection walk pushes discovered [`EventSource`]s into a
//! [`SourceQueue`]. The [`Foreman`] claims them in batches into tasks, hands
//! each task to one worker of a fixed-size pool, watches worker heartbeats,
//! and merges finished task segments into an [`OutputStore`] strictly in
//! task-creation order.
//!
//! - **Workers**: OS threads ([`ThreadLauncher`]), child processes
//!   ([`ProcessLauncher`] plus the `strata-worker` binary), or the inline
//!   single-threaded fallback ([`InlineLauncher`]).
//! - **Parsers**: anything implementing [`Parser`], made available through an
//!   explicit [`ParserTable`].
//! - **Durability**: per-attempt output segments, a commit-marked
//!   [`FileStore`], and an optional [`TaskJournal`] that lets
//!   [`Foreman::resume`] continue an interrupted run.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use strata_core::{
//!     BoundedSourceQueue, Foreman, ForemanConfig, FsResolver, MemoryStore,
//!     ParserTable, SegmentDir, SourceQueue, TaskRunner, ThreadLauncher,
//!     collect_directory,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! async fn extract() -> strata_core::Result<()> {
//!     let config = ForemanConfig::default();
//!     let resolver = Arc::new(FsResolver::new());
//!     let runner = TaskRunner::new(ParserTable::builtin(), resolver);
//!     let interval = config.heartbeat.interval();
//!     let launcher = Arc::new(ThreadLauncher::new(runner, interval));
//!     let segments = SegmentDir::create("/tmp/strata/segments")?;
//!
//!     let store = MemoryStore::new();
//!     let mut foreman =
//!         Foreman::start(config, launcher, store, segments, None).await?;
//!     let queue = BoundedSourceQueue::new(1_024);
//!     let walk = async {
//!         let root = std::path::Path::new("/mnt/evidence");
//!         let summary = collect_directory(root, &queue).await;
//!         queue.close();
//!         summary
//!     };
//!     let shutdown = CancellationToken::new();
//!     let (walked, summary) =
//!         tokio::join!(walk, foreman.run(&queue, shutdown));
//!     println!("{} sources, {} records", walked?.sources, summary?.records);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
pub mod foreman;
pub mod journal;
pub mod merge;
pub mod parser;
pub mod parsers;
pub mod queue;
pub mod resolver;
pub mod segment;
pub mod status;
pub mod store;
pub mod task;
pub mod walk;
pub mod worker;

pub use config::{ExecutionMode, ForemanConfig};
pub use error::{CoreError, Result, SegmentError};
pub use foreman::{Foreman, RunSummary, WorkerPool};
pub use journal::{RecoveredRun, TaskJournal};
pub use merge::{MergeEngine, MergeReport};
pub use parser::{
    ParseOutcome, Parser, ParserError, ParserTable, RecordEmitter,
};
pub use queue::{BoundedSourceQueue, LocalSourceQueue, SourceQueue};
pub use resolver::{FsResolver, ResolveError, SourceResolver};
pub use segment::SegmentDir;
pub use status::{StatusTable, WorkerStatus};
pub use store::{
    FileStore, FileStoreReader, MemoryStore, OutputStore, StoredRecord,
};
pub use task::{Task, TaskTable};
pub use walk::{WalkSummary, collect_directory};
pub use worker::{
    InlineLauncher, ProcessLauncher, TaskRunner, ThreadLauncher,
    WorkerLauncher, WorkerSettings, serve_stdio,
};

pub use strata_model::{
    EventSource, Record, TaskId, TaskOutcome, TaskState, WorkerId,
};
