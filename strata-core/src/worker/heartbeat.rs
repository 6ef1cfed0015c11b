use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strata_model::{TaskId, WorkerId};
use tracing::{debug, trace};

/// Counters carried by every heartbeat. Cumulative over the worker's life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatCounters {
    pub events_produced: u64,
    pub warnings: u64,
}

/// Worker-local progress shared between the parsing thread and the heartbeat
/// thread. Only the owning worker writes it.
#[derive(Debug, Default)]
pub struct WorkerProgress {
    /// Raw task id, zero when idle.
    current_task: AtomicU64,
    events_produced: AtomicU64,
    warnings: AtomicU64,
    abort: AtomicBool,
}

impl WorkerProgress {
    pub fn begin(&self, task: TaskId) {
        self.current_task.store(task.get(), Ordering::Release);
    }

    pub fn finish(&self) {
        self.current_task.store(0, Ordering::Release);
    }

    pub fn current_task(&self) -> Option<TaskId> {
        match self.current_task.load(Ordering::Acquire) {
            0 => None,
            raw => Some(TaskId(raw)),
        }
    }

    pub fn record_produced(&self) {
        self.events_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> HeartbeatCounters {
        HeartbeatCounters {
            events_produced: self.events_produced.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
        }
    }

    /// Asks the running parser to stop at its next emit.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Emits a heartbeat every `interval` until `alive` is cleared or `emit`
/// returns `false`. The cadence does not depend on record throughput, so a
/// slow parser still looks alive.
pub(crate) fn spawn_heartbeat<F>(
    worker: WorkerId,
    interval: Duration,
    progress: Arc<WorkerProgress>,
    alive: Arc<AtomicBool>,
    mut emit: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(Option<TaskId>, HeartbeatCounters) -> bool + Send + 'static,
{
    thread::Builder::new()
        .name(format!("strata-heartbeat-{}", worker.slot))
        .spawn(move || {
            while alive.load(Ordering::Acquire) {
                let task = progress.current_task();
                trace!(worker = %worker, task = ?task, "heartbeat");
                if !emit(task, progress.counters()) {
                    break;
                }
                thread::park_timeout(interval);
            }
            debug!(worker = %worker, "heartbeat stopped");
        })
}

/// Clears `alive` when dropped, including during a panic unwind. That is how
/// a crashed worker thread goes silent instead of reporting its own death.
#[derive(Debug)]
pub(crate) struct AliveGuard {
    alive: Arc<AtomicBool>,
    heartbeat: Option<thread::Thread>,
}

impl AliveGuard {
    pub(crate) fn new(
        alive: Arc<AtomicBool>,
        heartbeat: Option<thread::Thread>,
    ) -> Self {
        Self { alive, heartbeat }
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn progress_tracks_current_task_and_counters() {
        let progress = WorkerProgress::default();
        assert_eq!(progress.current_task(), None);

        progress.begin(TaskId(7));
        progress.record_produced();
        progress.record_produced();
        progress.record_warning();
        assert_eq!(progress.current_task(), Some(TaskId(7)));
        assert_eq!(
            progress.counters(),
            HeartbeatCounters {
                events_produced: 2,
                warnings: 1
            }
        );

        progress.finish();
        assert_eq!(progress.current_task(), None);
    }

    #[test]
    fn heartbeat_stops_when_guard_drops() {
        let alive = Arc::new(AtomicBool::new(true));
        let progress = Arc::new(WorkerProgress::default());
        let (tx, rx) = mpsc::channel();

        let handle = spawn_heartbeat(
            WorkerId::new(0, 0),
            Duration::from_millis(5),
            Arc::clone(&progress),
            Arc::clone(&alive),
            move |task, counters| tx.send((task, counters)).is_ok(),
        )
        .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        drop(AliveGuard::new(alive, Some(handle.thread().clone())));
        handle.join().unwrap();
    }
}
