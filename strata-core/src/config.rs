//! Foreman configuration types.
//!
//! All fields carry defaults so callers can supply partial payloads (TOML or
//! JSON) and still get a runnable engine.

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune foreman behaviour.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Worker pool sizing and execution mode.
    pub pool: PoolConfig,
    /// Heartbeat cadence and failure detection.
    pub heartbeat: HeartbeatConfig,
    /// Task sizing and retry budget.
    pub tasks: TaskConfig,
    /// Event source queue sizing.
    pub queue: QueueConfig,
    /// Worker-side buffering.
    pub worker: WorkerConfig,
    /// Graceful shutdown window.
    pub shutdown: ShutdownConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// N parallel workers (threads or child processes).
    Pool,
    /// Degraded fallback: one inline worker driven by the foreman itself.
    SingleThreaded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub mode: ExecutionMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            mode: ExecutionMode::Pool,
        }
    }
}

impl PoolConfig {
    /// Effective pool size; single-threaded mode always runs one slot.
    pub fn size(&self) -> usize {
        match self.mode {
            ExecutionMode::Pool => self.workers.max(1),
            ExecutionMode::SingleThreaded => 1,
        }
    }
}

/// Heartbeat/liveness tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Cadence at which workers report liveness, independent of throughput.
    pub interval_ms: u64,
    /// A worker silent for longer than this is declared stalled.
    pub timeout_ms: u64,
    /// How often the foreman runs its liveness sweep.
    pub check_interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 30_000,
            check_interval_ms: 1_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Upper bound on event sources claimed into one task.
    pub sources_per_task: usize,
    /// Attempts before an abandoned task is failed instead of re-queued.
    pub max_attempts: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            sources_per_task: 8,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the bounded event source queue. Producers block beyond it.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Records buffered between a parser and its segment writer.
    pub record_channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            record_channel_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight tasks may keep running after shutdown is requested.
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_ms: 10_000 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}
