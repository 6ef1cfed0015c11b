//! Workers and the seams the foreman drives them through.
//!
//! A worker is `IDLE -> RUNNING -> IDLE`: it receives an [`Assignment`],
//! runs it to completion with a [`TaskRunner`], and reports back. A crash is
//! never self-reported; the worker simply stops heartbeating and the foreman
//! notices.
//!
//! Three launchers implement [`WorkerLauncher`]:
//!
//! - [`ThreadLauncher`]: one OS thread per worker.
//! - [`ProcessLauncher`]: one child process per worker, speaking JSON lines
//!   over stdio (the child side is [`serve_stdio`]).
//! - [`InlineLauncher`]: the single-threaded fallback; assignments run on the
//!   foreman's own thread of control.

use std::fmt;

use async_trait::async_trait;
use strata_model::WorkerId;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;

mod heartbeat;
mod inline;
mod process;
mod protocol;
mod runner;
mod thread;

pub use heartbeat::{HeartbeatCounters, WorkerProgress};
pub use inline::InlineLauncher;
pub use process::{ProcessLauncher, serve_stdio};
pub use protocol::{
    Assignment, ControlMessage, TaskSummary, WorkerEvent, WorkerReport,
    WorkerSettings,
};
pub use runner::{TaskFailure, TaskRunner};
pub use thread::ThreadLauncher;

/// Foreman-side handle on one running worker.
#[async_trait]
pub trait WorkerHandle: Send + fmt::Debug {
    fn id(&self) -> WorkerId;

    fn pid(&self) -> Option<u32>;

    /// Whether liveness monitoring applies to this worker.
    fn emits_heartbeats(&self) -> bool;

    /// Hands over a task. The worker must be idle.
    async fn assign(&mut self, assignment: Assignment) -> Result<()>;

    /// Stops the worker without waiting for its current task.
    async fn terminate(&mut self);

    /// Asks the worker to exit once idle and waits for it.
    async fn shutdown(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    /// Starts a worker incarnation. Reports go to `events`.
    async fn launch(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>>;
}

fn report_for(
    assignment: &Assignment,
    result: std::result::Result<TaskSummary, TaskFailure>,
) -> WorkerReport {
    match result {
        Ok(summary) => WorkerReport::Processed {
            task: assignment.task_id,
            attempt: assignment.attempt,
            summary,
        },
        Err(failure) => WorkerReport::TaskFailed {
            task: assignment.task_id,
            attempt: assignment.attempt,
            reason: failure.to_string(),
        },
    }
}
