use async_trait::async_trait;
use strata_model::WorkerId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::{
    Assignment, TaskRunner, WorkerEvent, WorkerHandle, WorkerLauncher,
    WorkerReport, heartbeat::WorkerProgress, report_for,
};
use crate::error::{CoreError, Result};

/// Degraded single-threaded mode: the assignment runs to completion inside
/// [`WorkerHandle::assign`], on the caller's thread. Such a worker cannot
/// stall independently of the foreman, so it is not supervised.
#[derive(Debug, Clone)]
pub struct InlineLauncher {
    runner: TaskRunner,
}

impl InlineLauncher {
    pub fn new(runner: TaskRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WorkerLauncher for InlineLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>> {
        info!(worker = %id, "inline worker started");
        Ok(Box::new(InlineWorker {
            id,
            runner: self.runner.clone(),
            progress: WorkerProgress::default(),
            events,
            stopped: false,
        }))
    }
}

#[derive(Debug)]
struct InlineWorker {
    id: WorkerId,
    runner: TaskRunner,
    progress: WorkerProgress,
    events: UnboundedSender<WorkerEvent>,
    stopped: bool,
}

impl InlineWorker {
    fn send(&self, report: WorkerReport) -> Result<()> {
        self.events
            .send(WorkerEvent {
                worker: self.id,
                report,
            })
            .map_err(|_| CoreError::WorkerUnavailable {
                worker: self.id,
                reason: "foreman event channel closed".into(),
            })
    }
}

#[async_trait]
impl WorkerHandle for InlineWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn emits_heartbeats(&self) -> bool {
        false
    }

    async fn assign(&mut self, assignment: Assignment) -> Result<()> {
        if self.stopped {
            return Err(CoreError::WorkerUnavailable {
                worker: self.id,
                reason: "worker was stopped".into(),
            });
        }

        self.progress.begin(assignment.task_id);
        self.send(WorkerReport::Heartbeat {
            task: Some(assignment.task_id),
            counters: self.progress.counters(),
        })?;

        let result = self.runner.run(&assignment, &self.progress);
        self.progress.finish();
        debug!(
            worker = %self.id,
            task = %assignment.task_id,
            ok = result.is_ok(),
            "inline assignment finished"
        );

        self.send(WorkerReport::Heartbeat {
            task: None,
            counters: self.progress.counters(),
        })?;
        self.send(report_for(&assignment, result))
    }

    async fn terminate(&mut self) {
        self.stopped = true;
    }

    async fn shutdown(&mut self) {
        self.stopped = true;
    }
}
