//! The foreman: owns the task table, the worker pool, the journal and the
//! merge engine, and is the only writer of task state.
//!
//! Workers never touch the table. Everything they do arrives as a
//! [`WorkerEvent`] on one channel, and the foreman applies events in arrival
//! order from a single task, so every transition is serialised without a
//! lock around the table.

use std::{
    any::type_name,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use strata_model::{EventSource, TaskId, TaskOutcome, TaskState, WorkerId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ForemanConfig,
    error::{CoreError, Result},
    journal::TaskJournal,
    merge::{MergeEngine, MergeReport},
    segment::{SegmentDir, read_segment},
    status::WorkerStatus,
    store::OutputStore,
    task::{Task, TaskTable},
    worker::{
        Assignment, HeartbeatCounters, TaskSummary, WorkerEvent,
        WorkerLauncher, WorkerReport,
    },
};

mod pool;
mod run;

pub use pool::WorkerPool;
pub use run::RunSummary;

/// Running totals for one foreman lifetime.
#[derive(Debug, Default, Clone, Copy)]
struct RunStats {
    tasks_created: u64,
    abandoned_attempts: u64,
    merged: u64,
    failed: u64,
    records: u64,
    duplicates_dropped: u64,
}

impl RunStats {
    fn absorb(&mut self, report: &MergeReport) {
        self.merged += report.merged.len() as u64;
        self.failed += report.failed.len() as u64;
        self.records += report.records;
        self.duplicates_dropped += report.duplicates_dropped;
    }
}

pub struct Foreman<S> {
    config: ForemanConfig,
    tasks: TaskTable,
    pool: WorkerPool,
    merge: MergeEngine<S>,
    journal: Option<TaskJournal>,
    segments: SegmentDir,
    events_rx: Option<UnboundedReceiver<WorkerEvent>>,
    stats: RunStats,
}

impl<S> fmt::Debug for Foreman<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Foreman")
            .field("store", &type_name::<S>())
            .field("tasks", &self.tasks.len())
            .field("pool", &self.pool)
            .field("journal", &self.journal.as_ref().map(TaskJournal::path))
            .field("segments", &self.segments.root())
            .finish()
    }
}

impl<S: OutputStore> Foreman<S> {
    /// Launches the worker pool and returns a foreman with an empty task
    /// table. Use [`Foreman::resume`] to pick up a journaled run instead.
    pub async fn start(
        config: ForemanConfig,
        launcher: Arc<dyn WorkerLauncher>,
        store: S,
        segments: SegmentDir,
        journal: Option<TaskJournal>,
    ) -> Result<Self> {
        let (events_tx, events_rx): (UnboundedSender<WorkerEvent>, _) =
            mpsc::unbounded_channel();
        let pool =
            WorkerPool::start(launcher, config.pool.size(), events_tx).await?;
        info!(
            workers = pool.size(),
            mode = ?config.pool.mode,
            journal = ?journal.as_ref().map(TaskJournal::path),
            "foreman started"
        );
        Ok(Self {
            config,
            tasks: TaskTable::new(),
            pool,
            merge: MergeEngine::new(store),
            journal,
            segments,
            events_rx: Some(events_rx),
            stats: RunStats::default(),
        })
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Current state of a live task. Finalised tasks have left the table;
    /// ask [`Foreman::outcome`] for those.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(Task::state)
    }

    pub fn outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.merge.store().outcome(id)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.pool.snapshot()
    }

    pub fn store(&self) -> &S {
        self.merge.store()
    }

    pub fn segments(&self) -> &SegmentDir {
        &self.segments
    }

    pub fn has_idle_worker(&self) -> bool {
        self.pool.has_idle()
    }

    /// Tasks currently owned by a worker.
    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|task| task.state().is_in_flight()).count()
    }

    /// Stops the pool and hands back the output store.
    pub async fn into_store(mut self) -> S {
        self.pool.stop_all().await;
        self.merge.into_store()
    }

    /// Claims `sources` into a new task and dispatches it to an idle worker.
    ///
    /// Refuses before allocating an id when there is nothing to claim or no
    /// idle worker, so ids stay dense. If the worker turns out to be gone the
    /// task stays `created` and is dispatched again later.
    pub async fn create_task(
        &mut self,
        sources: Vec<EventSource>,
    ) -> Result<TaskId> {
        if sources.is_empty() {
            return Err(CoreError::EmptyTask);
        }
        let Some(slot) = self.pool.idle_slot() else {
            return Err(CoreError::NoIdleWorker);
        };

        let id = self.tasks.create(sources)?;
        self.stats.tasks_created += 1;
        if let Some(journal) = self.journal.as_mut()
            && let Some(task) = self.tasks.get(id)
        {
            journal.record_created(id, task.attempt(), task.sources(), None)?;
        }
        debug!(task = %id, "task created");

        self.dispatch(id, slot).await?;
        Ok(id)
    }

    /// Hands every `created` task to an idle worker, lowest id first.
    pub async fn dispatch_pending(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        while let Some(id) = self.tasks.next_created() {
            let Some(slot) = self.pool.idle_slot() else {
                break;
            };
            if !self.dispatch(id, slot).await? {
                // The slot was refilled with a fresh worker; try again on the
                // next event rather than spinning here.
                break;
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn dispatch(&mut self, id: TaskId, slot: usize) -> Result<bool> {
        let task = self.tasks.require_mut(id)?;
        let attempt = task.attempt();
        let assignment = Assignment {
            task_id: id,
            attempt,
            sources: task.sources().to_vec(),
            segment: self.segments.path_for(id, attempt),
        };

        match self.pool.assign(slot, assignment).await {
            Ok(worker) => {
                self.tasks.require_mut(id)?.worker = Some(worker);
                self.advance(id, TaskState::Scheduled, None)?;
                debug!(task = %id, attempt, worker = %worker, "task scheduled");
                Ok(true)
            }
            Err(CoreError::WorkerUnavailable { worker, reason }) => {
                warn!(
                    task = %id,
                    worker = %worker,
                    %reason,
                    "dispatch failed; replacing worker"
                );
                self.pool.replace(slot).await?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Transitions `id` and journals the move.
    fn advance(
        &mut self,
        id: TaskId,
        next: TaskState,
        note: Option<&str>,
    ) -> Result<()> {
        let task = self.tasks.require_mut(id)?;
        let from = task.transition(next)?;
        let attempt = task.attempt();
        if let Some(journal) = self.journal.as_mut() {
            journal.record_transition(id, attempt, from, next, note)?;
        }
        trace!(task = %id, attempt, %from, to = %next, "transition");
        Ok(())
    }

    /// Slot of `worker` if it is still the current incarnation and is
    /// running attempt `attempt` of `task`.
    fn owning_slot(
        &self,
        worker: WorkerId,
        task: TaskId,
        attempt: u32,
    ) -> Option<usize> {
        let slot = self.pool.slot_of(worker)?;
        if self.pool.task_of(slot) != Some(task) {
            return None;
        }
        self.tasks
            .get(task)
            .filter(|t| {
                t.attempt() == attempt
                    && t.worker == Some(worker)
                    && t.state().is_in_flight()
            })
            .map(|_| slot)
    }

    /// Applies a heartbeat to the worker's status entry. The first beat for
    /// a scheduled task marks it `processing`.
    pub fn report_heartbeat(
        &mut self,
        worker: WorkerId,
        task: Option<TaskId>,
        counters: HeartbeatCounters,
    ) -> Result<()> {
        if !self
            .pool
            .status_mut()
            .heartbeat(worker, task, counters, Instant::now())
        {
            trace!(worker = %worker, "heartbeat from replaced worker ignored");
            return Ok(());
        }

        let Some(id) = task else {
            return Ok(());
        };
        let owned = self
            .pool
            .slot_of(worker)
            .is_some_and(|slot| self.pool.task_of(slot) == Some(id));
        if owned && self.task_state(id) == Some(TaskState::Scheduled) {
            self.advance(id, TaskState::Processing, None)?;
        }
        Ok(())
    }

    /// A worker sealed its segment. Returns `false` when the report is stale
    /// (the attempt was abandoned or the worker replaced) and was dropped.
    pub fn report_processed(
        &mut self,
        worker: WorkerId,
        task: TaskId,
        attempt: u32,
        summary: TaskSummary,
    ) -> Result<bool> {
        let Some(slot) = self.owning_slot(worker, task, attempt) else {
            let superseded = self
                .tasks
                .get(task)
                .is_none_or(|t| t.attempt() != attempt);
            if superseded {
                self.segments.discard(task, attempt);
            }
            debug!(
                task = %task,
                attempt,
                worker = %worker,
                "stale completion report dropped"
            );
            return Ok(false);
        };

        self.pool.release(slot);
        if self.task_state(task) == Some(TaskState::Scheduled) {
            self.advance(task, TaskState::Processing, None)?;
        }
        self.advance(task, TaskState::Processed, None)?;
        self.advance(task, TaskState::PendingMerge, None)?;
        info!(
            task = %task,
            attempt,
            worker = %worker,
            records = summary.records,
            warnings = summary.warnings,
            "task processed"
        );
        Ok(true)
    }

    /// A worker gave up on a task without crashing (segment I/O failure or
    /// an abort). The attempt is abandoned and retried like a crash.
    pub fn report_task_failed(
        &mut self,
        worker: WorkerId,
        task: TaskId,
        attempt: u32,
        reason: &str,
    ) -> Result<()> {
        let Some(slot) = self.owning_slot(worker, task, attempt) else {
            debug!(
                task = %task,
                attempt,
                worker = %worker,
                "stale failure report dropped"
            );
            return Ok(());
        };
        self.pool.release(slot);
        warn!(
            task = %task,
            attempt,
            worker = %worker,
            %reason,
            "worker failed task"
        );
        self.abandon(
            task,
            format!("attempt {attempt} failed on worker {worker}: {reason}"),
        )?;
        Ok(())
    }

    /// Abandons the current attempt of `id`: its segment is discarded and the
    /// task goes back to `created` with a new attempt, or to `failed` once
    /// the attempt budget is spent. Returns the resulting state.
    ///
    /// The worker slot is left alone; callers release or replace it.
    pub(crate) fn abandon(
        &mut self,
        id: TaskId,
        note: String,
    ) -> Result<TaskState> {
        let task = self.tasks.require_mut(id)?;
        let attempt = task.attempt();
        task.add_note(note.clone());
        self.advance(id, TaskState::Abandoned, Some(&note))?;
        self.segments.discard(id, attempt);
        self.stats.abandoned_attempts += 1;

        if attempt >= self.config.tasks.max_attempts {
            self.advance(id, TaskState::Failed, None)?;
            warn!(task = %id, attempt, "retries exhausted; task failed");
            Ok(TaskState::Failed)
        } else {
            self.advance(id, TaskState::Created, None)?;
            info!(task = %id, next_attempt = attempt + 1, "task re-queued");
            Ok(TaskState::Created)
        }
    }

    /// Liveness sweep: every supervised worker silent for longer than the
    /// heartbeat timeout is replaced, and the task it was running is
    /// abandoned. Tasks it already sealed keep their segment unless the
    /// segment no longer reads back. Returns the workers declared stalled.
    pub async fn check_liveness(
        &mut self,
        now: Instant,
    ) -> Result<Vec<WorkerId>> {
        let timeout = self.config.heartbeat.timeout();
        let stale = self.pool.status().stale_workers(now, timeout);

        for &worker in &stale {
            let Some(slot) = self.pool.slot_of(worker) else {
                continue;
            };
            let silent = self
                .pool
                .status()
                .get(slot)
                .map_or(Duration::ZERO, |status| status.silent_for(now));
            warn!(
                target: "strata::liveness",
                worker = %worker,
                silent_ms = silent.as_millis() as u64,
                "worker stopped heartbeating"
            );

            let segments = &self.segments;
            let lost = self.tasks.ids_where(|task| {
                if task.worker != Some(worker) {
                    return false;
                }
                match task.state() {
                    state if state.is_in_flight() => true,
                    // Sealed and reported while the worker was still alive;
                    // only redone if the segment did not survive.
                    TaskState::PendingMerge => {
                        let path = segments.path_for(task.id(), task.attempt());
                        read_segment(&path).is_err()
                    }
                    _ => false,
                }
            });
            for id in lost {
                self.abandon(
                    id,
                    format!("worker {worker} stopped responding"),
                )?;
            }
            self.pool.replace(slot).await?;
        }
        Ok(stale)
    }

    /// Merges whatever is ready at the front of the table.
    pub fn merge_ready_tasks(&mut self) -> Result<MergeReport> {
        let report = self.merge.merge_ready_tasks(
            &mut self.tasks,
            &self.segments,
            self.journal.as_mut(),
        )?;
        self.stats.absorb(&report);
        if !report.is_empty() {
            info!(
                merged = report.merged.len(),
                failed = report.failed.len(),
                records = report.records,
                "tasks finalised"
            );
        }
        Ok(report)
    }

    pub async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        let WorkerEvent { worker, report } = event;
        match report {
            WorkerReport::Ready { pid } => {
                self.pool.status_mut().set_pid(worker, pid);
                debug!(worker = %worker, pid, "worker ready");
            }
            WorkerReport::Heartbeat { task, counters } => {
                self.report_heartbeat(worker, task, counters)?;
            }
            WorkerReport::Processed {
                task,
                attempt,
                summary,
            } => {
                self.report_processed(worker, task, attempt, summary)?;
            }
            WorkerReport::TaskFailed {
                task,
                attempt,
                reason,
            } => {
                self.report_task_failed(worker, task, attempt, &reason)?;
            }
        }
        Ok(())
    }

    /// Dispatch and merge after a state change.
    async fn settle(&mut self) -> Result<()> {
        self.dispatch_pending().await?;
        self.merge_ready_tasks()?;
        Ok(())
    }

    /// Waits up to `wait` for the next worker event, then applies it and
    /// everything else already queued, dispatching and merging as it goes.
    /// Returns how many events were applied. Used when driving the foreman
    /// by hand instead of through [`Foreman::run`].
    pub async fn pump_events(&mut self, wait: Duration) -> Result<usize> {
        let Some(mut events) = self.events_rx.take() else {
            return Err(CoreError::Internal(
                "foreman event loop is already running".into(),
            ));
        };
        let result = self.pump_from(&mut events, wait).await;
        self.events_rx = Some(events);
        result
    }

    async fn pump_from(
        &mut self,
        events: &mut UnboundedReceiver<WorkerEvent>,
        wait: Duration,
    ) -> Result<usize> {
        let mut handled = 0;
        if let Ok(Some(event)) =
            tokio::time::timeout(wait, events.recv()).await
        {
            self.handle_event(event).await?;
            handled += 1;
            while let Ok(event) = events.try_recv() {
                self.handle_event(event).await?;
                handled += 1;
            }
        }
        self.settle().await?;
        Ok(handled)
    }
}
