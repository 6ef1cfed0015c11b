//! The foreman's event loop, shutdown and restart.

use std::{collections::HashSet, path::Path, sync::Arc, time::Instant};

use strata_model::{RunId, TaskId, TaskState};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Foreman;
use crate::{
    config::ForemanConfig,
    error::{CoreError, Result},
    journal::{self, RecoveredRun, TaskJournal},
    queue::{SourceQueue, claim_batch},
    segment::SegmentDir,
    store::OutputStore,
    task::{Task, TaskTable},
    worker::{WorkerEvent, WorkerLauncher},
};

const INTERRUPTED: &str = "run interrupted before the task completed";

/// How a call to [`Foreman::run`] ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tasks_created: u64,
    pub merged: u64,
    pub failed: u64,
    /// Attempts abandoned after a crash, stall or worker-side failure.
    pub abandoned_attempts: u64,
    pub records: u64,
    pub duplicates_dropped: u64,
    /// Shutdown was requested before the queue was exhausted.
    pub interrupted: bool,
    /// Tasks left in the journal for a later resume.
    pub unfinished_tasks: usize,
    /// Sources still queued at shutdown. Journaled as a deferred batch when
    /// a journal is attached, otherwise reported as a failed task.
    pub deferred_sources: usize,
}

impl<S: OutputStore> Foreman<S> {
    /// Drives the foreman until `queue` is closed and every task is
    /// finalised, or until `shutdown` fires.
    ///
    /// Sources are claimed only while a worker is idle and no re-queued task
    /// is waiting, so the queue fills up and blocks its producers whenever
    /// the pool is saturated.
    pub async fn run<Q>(
        &mut self,
        queue: &Q,
        shutdown: CancellationToken,
    ) -> Result<RunSummary>
    where
        Q: SourceQueue + ?Sized,
    {
        let Some(mut events) = self.events_rx.take() else {
            return Err(CoreError::Internal(
                "foreman event loop is already running".into(),
            ));
        };
        let result = self.drive(queue, &mut events, &shutdown).await;
        self.events_rx = Some(events);
        result
    }

    async fn drive<Q>(
        &mut self,
        queue: &Q,
        events: &mut UnboundedReceiver<WorkerEvent>,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary>
    where
        Q: SourceQueue + ?Sized,
    {
        let batch_size = self.config.tasks.sources_per_task.max(1);
        let mut liveness =
            time::interval(self.config.heartbeat.check_interval());
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Restored tasks go first.
        self.settle().await?;

        let mut queue_done = false;
        let mut interrupted = false;
        info!(workers = self.pool.size(), batch_size, "foreman running");

        loop {
            if queue_done && self.tasks.is_empty() {
                break;
            }
            let can_claim = !queue_done
                && self.pool.has_idle()
                && !self.tasks.has_created();

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await?;
                    self.settle().await?;
                }
                _ = liveness.tick() => {
                    self.check_liveness(Instant::now()).await?;
                    self.settle().await?;
                }
                batch = claim_batch(queue, batch_size), if can_claim => {
                    match batch {
                        Some(sources) => {
                            self.create_task(sources).await?;
                            self.merge_ready_tasks()?;
                        }
                        None => {
                            debug!("source queue closed and drained");
                            queue_done = true;
                        }
                    }
                }
            }
        }

        let deferred_sources = if interrupted {
            self.wind_down(queue, events, &mut liveness).await?
        } else {
            0
        };
        self.pool.stop_all().await;

        let summary = RunSummary {
            tasks_created: self.stats.tasks_created,
            merged: self.stats.merged,
            failed: self.stats.failed,
            abandoned_attempts: self.stats.abandoned_attempts,
            records: self.stats.records,
            duplicates_dropped: self.stats.duplicates_dropped,
            interrupted,
            unfinished_tasks: self.tasks.len(),
            deferred_sources,
        };
        info!(
            merged = summary.merged,
            failed = summary.failed,
            records = summary.records,
            interrupted,
            unfinished = summary.unfinished_tasks,
            "foreman finished"
        );
        Ok(summary)
    }

    /// Graceful shutdown: stop claiming, give in-flight tasks the grace
    /// period, then abandon whatever is still running. Returns how many
    /// queued sources were never claimed.
    async fn wind_down<Q>(
        &mut self,
        queue: &Q,
        events: &mut UnboundedReceiver<WorkerEvent>,
        liveness: &mut time::Interval,
    ) -> Result<usize>
    where
        Q: SourceQueue + ?Sized,
    {
        queue.close();
        let grace = self.config.shutdown.grace();
        let deadline = time::Instant::now() + grace;
        info!(
            grace_ms = grace.as_millis() as u64,
            in_flight = self.in_flight(),
            "shutdown requested; waiting for in-flight tasks"
        );

        while self.in_flight() > 0 {
            tokio::select! {
                biased;

                _ = time::sleep_until(deadline) => break,
                Some(event) = events.recv() => {
                    self.handle_event(event).await?;
                    self.merge_ready_tasks()?;
                }
                _ = liveness.tick() => {
                    self.check_liveness(Instant::now()).await?;
                }
            }
        }

        let stuck = self.tasks.ids_where(|task| task.state().is_in_flight());
        if !stuck.is_empty() {
            warn!(
                tasks = stuck.len(),
                "grace period over; abandoning in-flight tasks"
            );
        }
        for id in stuck {
            self.abandon_for_shutdown(id)?;
        }

        let unclaimed = queue.drain();
        let deferred = unclaimed.len();
        match self.journal.as_mut() {
            Some(journal) => {
                if !unclaimed.is_empty() {
                    let batch = journal.record_deferred(&unclaimed)?;
                    info!(
                        batch,
                        sources = deferred,
                        "unclaimed sources deferred to the journal"
                    );
                }
                self.merge_ready_tasks()?;
            }
            None => {
                // Nothing carries this work into a later run; finalise it as
                // failed so the store shows what was skipped.
                if !unclaimed.is_empty() {
                    self.tasks.create(unclaimed)?;
                    self.stats.tasks_created += 1;
                    warn!(
                        sources = deferred,
                        "unclaimed sources dropped; no journal attached"
                    );
                }
                let report = self.merge.finish_incomplete(
                    &mut self.tasks,
                    &self.segments,
                    INTERRUPTED,
                )?;
                self.stats.absorb(&report);
            }
        }
        Ok(deferred)
    }

    /// Abandons an in-flight task at shutdown. With a journal it goes back to
    /// `created` for the next run; without one it is failed outright.
    fn abandon_for_shutdown(&mut self, id: TaskId) -> Result<()> {
        let task = self.tasks.require_mut(id)?;
        let attempt = task.attempt();
        task.add_note(INTERRUPTED);
        self.advance(id, TaskState::Abandoned, Some(INTERRUPTED))?;
        self.segments.discard(id, attempt);
        self.stats.abandoned_attempts += 1;

        let next = if self.journal.is_some() {
            TaskState::Created
        } else {
            TaskState::Failed
        };
        self.advance(id, next, None)?;
        debug!(
            task = %id,
            attempt,
            state = %next,
            "task abandoned at shutdown"
        );
        Ok(())
    }

    /// Starts a foreman that continues the run journaled at `journal_path`.
    ///
    /// Tasks already committed to `store` are skipped. Tasks whose sealed
    /// segment survived are merged as they are. Everything else is redone
    /// with the same id, and deferred sources become new tasks.
    pub async fn resume(
        config: ForemanConfig,
        launcher: Arc<dyn WorkerLauncher>,
        store: S,
        segments: SegmentDir,
        journal_path: &Path,
    ) -> Result<Self> {
        let recovered = journal::replay(journal_path)?;
        let journal = TaskJournal::open(journal_path, RunId::new())?;
        let mut foreman =
            Self::start(config, launcher, store, segments, Some(journal))
                .await?;
        foreman.restore(recovered)?;
        Ok(foreman)
    }

    fn restore(&mut self, recovered: RecoveredRun) -> Result<()> {
        let batch_size = self.config.tasks.sources_per_task.max(1);
        let mut keep = HashSet::new();
        let (mut mergeable, mut redo, mut skipped) = (0usize, 0usize, 0usize);

        self.tasks = TaskTable::starting_at(recovered.next_task_id());
        for (id, previous) in recovered.tasks {
            if self.merge.store().is_committed(id) {
                skipped += 1;
                continue;
            }

            let attempt = previous.attempt;
            let segment_sealed = self.segments.path_for(id, attempt).exists();
            let task = match previous.state {
                TaskState::PendingMerge | TaskState::Merging
                    if segment_sealed =>
                {
                    keep.insert((id, attempt));
                    mergeable += 1;
                    let mut task = Task::restored(
                        id,
                        attempt,
                        previous.sources,
                        previous.notes,
                    );
                    task.restore_state(TaskState::PendingMerge);
                    task
                }
                TaskState::Failed => {
                    let mut task = Task::restored(
                        id,
                        attempt,
                        previous.sources,
                        previous.notes,
                    );
                    task.restore_state(TaskState::Failed);
                    task
                }
                TaskState::Created => {
                    redo += 1;
                    Task::restored(
                        id,
                        attempt,
                        previous.sources,
                        previous.notes,
                    )
                }
                state => {
                    redo += 1;
                    // Journaled as an abandonment so a second restart keeps
                    // the note and the attempt count.
                    let note = format!(
                        "attempt {attempt} was {state} when the previous run \
                         stopped"
                    );
                    if let Some(journal) = self.journal.as_mut() {
                        journal.record_transition(
                            id,
                            attempt,
                            state,
                            TaskState::Abandoned,
                            Some(&note),
                        )?;
                        journal.record_transition(
                            id,
                            attempt + 1,
                            TaskState::Abandoned,
                            TaskState::Created,
                            None,
                        )?;
                    }
                    let mut notes = previous.notes;
                    notes.push(note);
                    Task::restored(id, attempt + 1, previous.sources, notes)
                }
            };
            self.tasks.insert(task);
        }

        let mut deferred = 0;
        for (batch, sources) in recovered.deferred {
            for chunk in sources.chunks(batch_size) {
                let id = self.tasks.create(chunk.to_vec())?;
                self.stats.tasks_created += 1;
                if let Some(journal) = self.journal.as_mut() {
                    journal.record_created(id, 1, chunk, Some(batch))?;
                }
                deferred += chunk.len();
            }
        }

        let swept = self
            .segments
            .sweep(|task, attempt| keep.contains(&(task, attempt)))?;
        info!(
            mergeable,
            redo,
            skipped,
            deferred_sources = deferred,
            stale_segments = swept,
            "previous run restored"
        );
        Ok(())
    }
}
