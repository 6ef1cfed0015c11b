use std::{
    any::type_name_of_val,
    fmt,
    sync::Arc,
    time::Instant,
};

use strata_model::{TaskId, WorkerId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::{
    error::{CoreError, Result},
    status::{StatusTable, WorkerStatus},
    worker::{Assignment, WorkerEvent, WorkerHandle, WorkerLauncher},
};

struct Slot {
    handle: Box<dyn WorkerHandle>,
    task: Option<TaskId>,
}

/// Fixed number of worker slots. A slot keeps its index for the life of the
/// pool; the worker in it may be replaced.
pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    events: UnboundedSender<WorkerEvent>,
    slots: Vec<Slot>,
    status: StatusTable,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let busy = self.slots.iter().filter(|slot| slot.task.is_some()).count();
        f.debug_struct("WorkerPool")
            .field("launcher", &type_name_of_val(self.launcher.as_ref()))
            .field("size", &self.slots.len())
            .field("busy", &busy)
            .finish()
    }
}

impl WorkerPool {
    pub async fn start(
        launcher: Arc<dyn WorkerLauncher>,
        size: usize,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Self> {
        let size = u16::try_from(size.max(1)).map_err(|_| {
            CoreError::Internal(format!("pool size {size} exceeds slot range"))
        })?;

        let mut pool = Self {
            launcher,
            events,
            slots: Vec::with_capacity(usize::from(size)),
            status: StatusTable::new(),
        };
        for slot in 0..size {
            let handle = pool.launch(WorkerId::new(slot, 0)).await?;
            pool.slots.push(Slot { handle, task: None });
        }
        info!(size, "worker pool started");
        Ok(pool)
    }

    async fn launch(
        &mut self,
        id: WorkerId,
    ) -> Result<Box<dyn WorkerHandle>> {
        let handle = self.launcher.launch(id, self.events.clone()).await?;
        self.status.register(
            id,
            handle.pid(),
            handle.emits_heartbeats(),
            Instant::now(),
        );
        Ok(handle)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.task.is_none())
    }

    pub fn has_idle(&self) -> bool {
        self.idle_slot().is_some()
    }

    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.task.is_some()).count()
    }

    pub fn worker_id(&self, slot: usize) -> Option<WorkerId> {
        self.slots.get(slot).map(|slot| slot.handle.id())
    }

    /// Slot currently held by `worker`; `None` if that incarnation was
    /// replaced.
    pub fn slot_of(&self, worker: WorkerId) -> Option<usize> {
        let slot = usize::from(worker.slot);
        self.slots
            .get(slot)
            .filter(|current| current.handle.id() == worker)
            .map(|_| slot)
    }

    pub fn task_of(&self, slot: usize) -> Option<TaskId> {
        self.slots.get(slot).and_then(|slot| slot.task)
    }

    pub async fn assign(
        &mut self,
        slot: usize,
        assignment: Assignment,
    ) -> Result<WorkerId> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| {
                CoreError::Internal(format!("no worker slot {slot}"))
            })?;
        if entry.task.is_some() {
            return Err(CoreError::NoIdleWorker);
        }

        let task = assignment.task_id;
        entry.handle.assign(assignment).await?;
        entry.task = Some(task);
        let worker = entry.handle.id();
        self.status.assigned(worker, task, Instant::now());
        Ok(worker)
    }

    pub fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.task = None;
        }
    }

    /// Terminates the worker in `slot` and starts its successor.
    pub async fn replace(&mut self, slot: usize) -> Result<WorkerId> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| {
                CoreError::Internal(format!("no worker slot {slot}"))
            })?;
        let old = entry.handle.id();
        entry.handle.terminate().await;

        let successor = old.successor();
        let handle = self.launch(successor).await?;
        self.slots[slot] = Slot { handle, task: None };
        warn!(old = %old, new = %successor, "worker replaced");
        Ok(successor)
    }

    pub fn status(&self) -> &StatusTable {
        &self.status
    }

    pub(crate) fn status_mut(&mut self) -> &mut StatusTable {
        &mut self.status
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.status.snapshot()
    }

    /// Graceful stop for idle workers, hard stop for busy ones.
    pub async fn stop_all(&mut self) {
        for slot in &mut self.slots {
            if slot.task.is_some() {
                slot.handle.terminate().await;
            } else {
                slot.handle.shutdown().await;
            }
            slot.task = None;
        }
        info!("worker pool stopped");
    }
}
