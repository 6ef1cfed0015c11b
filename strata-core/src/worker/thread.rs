use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use async_trait::async_trait;
use strata_model::WorkerId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::{
    Assignment, ControlMessage, TaskRunner, WorkerEvent, WorkerHandle,
    WorkerLauncher, WorkerReport,
    heartbeat::{AliveGuard, WorkerProgress, spawn_heartbeat},
    report_for,
};
use crate::error::{CoreError, Result};

/// Runs each worker on its own OS thread.
///
/// A thread cannot be killed. Termination raises the abort flag, which the
/// parser observes at its next emit, and silences the heartbeat; the thread
/// is then left to wind down on its own.
#[derive(Debug, Clone)]
pub struct ThreadLauncher {
    runner: TaskRunner,
    heartbeat_interval: Duration,
}

impl ThreadLauncher {
    pub fn new(runner: TaskRunner, heartbeat_interval: Duration) -> Self {
        Self {
            runner,
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl WorkerLauncher for ThreadLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let (control_tx, control_rx) = mpsc::channel();
        let progress = Arc::new(WorkerProgress::default());
        let alive = Arc::new(AtomicBool::new(true));

        let heartbeat = {
            let events = events.clone();
            spawn_heartbeat(
                id,
                self.heartbeat_interval,
                Arc::clone(&progress),
                Arc::clone(&alive),
                move |task, counters| {
                    events
                        .send(WorkerEvent {
                            worker: id,
                            report: WorkerReport::Heartbeat { task, counters },
                        })
                        .is_ok()
                },
            )?
        };

        let guard = AliveGuard::new(
            Arc::clone(&alive),
            Some(heartbeat.thread().clone()),
        );
        let runner = self.runner.clone();
        let worker_progress = Arc::clone(&progress);
        let thread = thread::Builder::new()
            .name(format!("strata-worker-{}", id.slot))
            .spawn(move || {
                worker_loop(
                    id,
                    runner,
                    control_rx,
                    events,
                    worker_progress,
                    guard,
                )
            })?;

        info!(worker = %id, "thread worker started");
        Ok(Box::new(ThreadWorker {
            id,
            control: Some(control_tx),
            progress,
            alive,
            heartbeat: Some(heartbeat),
            thread: Some(thread),
        }))
    }
}

fn worker_loop(
    id: WorkerId,
    runner: TaskRunner,
    control: Receiver<ControlMessage>,
    events: UnboundedSender<WorkerEvent>,
    progress: Arc<WorkerProgress>,
    guard: AliveGuard,
) {
    // Dropped on return and on unwind alike.
    let _guard = guard;

    while let Ok(message) = control.recv() {
        match message {
            ControlMessage::Assign { assignment } => {
                progress.begin(assignment.task_id);
                let started = events.send(WorkerEvent {
                    worker: id,
                    report: WorkerReport::Heartbeat {
                        task: Some(assignment.task_id),
                        counters: progress.counters(),
                    },
                });
                if started.is_err() {
                    break;
                }

                let result = runner.run(&assignment, &progress);
                progress.finish();
                if progress.abort_requested() {
                    debug!(
                        worker = %id,
                        task = %assignment.task_id,
                        "terminated mid-task"
                    );
                    break;
                }
                let report = report_for(&assignment, result);
                if events.send(WorkerEvent { worker: id, report }).is_err() {
                    break;
                }
            }
            ControlMessage::Shutdown => break,
            ControlMessage::Configure { .. } => {}
        }
    }
    debug!(worker = %id, "thread worker exiting");
}

#[derive(Debug)]
struct ThreadWorker {
    id: WorkerId,
    control: Option<Sender<ControlMessage>>,
    progress: Arc<WorkerProgress>,
    alive: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadWorker {
    fn silence(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.thread().unpark();
        }
    }
}

#[async_trait]
impl WorkerHandle for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn emits_heartbeats(&self) -> bool {
        true
    }

    async fn assign(&mut self, assignment: Assignment) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| CoreError::WorkerUnavailable {
                worker: self.id,
                reason: "worker was stopped".into(),
            })?;
        control
            .send(ControlMessage::Assign { assignment })
            .map_err(|_| CoreError::WorkerUnavailable {
                worker: self.id,
                reason: "worker thread has exited".into(),
            })
    }

    async fn terminate(&mut self) {
        self.progress.request_abort();
        self.control = None;
        self.silence();
        // Detach: a stuck parser must not hold up the foreman.
        self.thread = None;
        self.heartbeat = None;
        warn!(worker = %self.id, "thread worker terminated");
    }

    async fn shutdown(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(ControlMessage::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let joined =
                tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(worker = %self.id, "worker thread ended abnormally");
            }
        }
        self.silence();
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = tokio::task::spawn_blocking(move || heartbeat.join()).await;
        }
        debug!(worker = %self.id, "thread worker shut down");
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.progress.request_abort();
            self.silence();
        }
    }
}
