//! Per-worker liveness and progress.
//!
//! One entry per pool slot for the lifetime of the pool. Workers are the
//! only writers of their own entry: they send heartbeat reports, and the
//! foreman applies each report to the entry of the worker that sent it.
//! Everything else reads snapshots.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use strata_model::{TaskId, WorkerId};

use crate::worker::HeartbeatCounters;

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker: WorkerId,
    pub pid: Option<u32>,
    pub current_task: Option<TaskId>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub events_produced: u64,
    pub warnings: u64,
    /// Whether the worker emits heartbeats at all. Unsupervised workers
    /// (the inline fallback) are never declared stalled.
    pub supervised: bool,
}

impl WorkerStatus {
    fn new(
        worker: WorkerId,
        pid: Option<u32>,
        supervised: bool,
        now: Instant,
    ) -> Self {
        Self {
            worker,
            pid,
            current_task: None,
            last_heartbeat: now,
            last_heartbeat_at: Utc::now(),
            events_produced: 0,
            warnings: 0,
            supervised,
        }
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

#[derive(Debug, Default)]
pub struct StatusTable {
    slots: Vec<WorkerStatus>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a (new or replacement) worker in its slot. The liveness clock
    /// starts now.
    pub fn register(
        &mut self,
        worker: WorkerId,
        pid: Option<u32>,
        supervised: bool,
        now: Instant,
    ) {
        let slot = usize::from(worker.slot);
        let status = WorkerStatus::new(worker, pid, supervised, now);
        if slot < self.slots.len() {
            self.slots[slot] = status;
        } else {
            debug_assert_eq!(
                slot,
                self.slots.len(),
                "slots are registered in order"
            );
            self.slots.push(status);
        }
    }

    pub fn get(&self, slot: usize) -> Option<&WorkerStatus> {
        self.slots.get(slot)
    }

    fn current_mut(&mut self, worker: WorkerId) -> Option<&mut WorkerStatus> {
        self.slots
            .get_mut(usize::from(worker.slot))
            .filter(|status| status.worker == worker)
    }

    pub fn set_pid(&mut self, worker: WorkerId, pid: u32) {
        if let Some(status) = self.current_mut(worker) {
            status.pid = Some(pid);
        }
    }

    /// Applies a heartbeat. Returns `false` for reports from a worker that
    /// has been replaced in the meantime.
    pub fn heartbeat(
        &mut self,
        worker: WorkerId,
        task: Option<TaskId>,
        counters: HeartbeatCounters,
        now: Instant,
    ) -> bool {
        let Some(status) = self.current_mut(worker) else {
            return false;
        };
        status.current_task = task;
        status.last_heartbeat = now;
        status.last_heartbeat_at = Utc::now();
        status.events_produced = counters.events_produced;
        status.warnings = counters.warnings;
        true
    }

    /// Records a new assignment and restarts the liveness clock, so the
    /// timeout is measured from dispatch rather than from the last idle beat.
    pub fn assigned(&mut self, worker: WorkerId, task: TaskId, now: Instant) {
        if let Some(status) = self.current_mut(worker) {
            status.current_task = Some(task);
            status.last_heartbeat = now;
        }
    }

    /// Supervised workers silent for longer than `timeout`.
    pub fn stale_workers(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|status| {
                status.supervised && status.silent_for(now) > timeout
            })
            .map(|status| status.worker)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.slots.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
