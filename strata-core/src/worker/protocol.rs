//! Messages between the foreman and its workers.
//!
//! Thread workers exchange these values over channels; process workers
//! exchange them as JSON lines over the child's stdin and stdout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_model::{EventSource, TaskId, WorkerId};

use super::heartbeat::HeartbeatCounters;
use crate::config::ForemanConfig;

/// One task handed to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub attempt: u32,
    pub sources: Vec<EventSource>,
    /// Segment file private to this attempt.
    pub segment: PathBuf,
}

/// Worker-side tuning sent once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub heartbeat_interval_ms: u64,
    pub record_channel_capacity: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &ForemanConfig) -> Self {
        Self {
            heartbeat_interval_ms: config.heartbeat.interval_ms,
            record_channel_capacity: config.worker.record_channel_capacity,
        }
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Configure {
        worker: WorkerId,
        settings: WorkerSettings,
    },
    Assign {
        assignment: Assignment,
    },
    /// Finish the current task, if any, then exit.
    Shutdown,
}

/// What a worker wrote for one finished task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub records: u64,
    pub warnings: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReport {
    Ready {
        pid: u32,
    },
    Heartbeat {
        task: Option<TaskId>,
        counters: HeartbeatCounters,
    },
    /// Parsing finished and the segment is sealed.
    Processed {
        task: TaskId,
        attempt: u32,
        summary: TaskSummary,
    },
    /// The worker could not produce a usable segment (segment I/O failure or
    /// an abort). The task should be retried elsewhere.
    TaskFailed {
        task: TaskId,
        attempt: u32,
        reason: String,
    },
}

/// A report tagged with the worker incarnation that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub report: WorkerReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_are_tagged_json() {
        let json = serde_json::to_string(&ControlMessage::Shutdown).unwrap();
        assert_eq!(json, r#"{"kind":"shutdown"}"#);

        let report: WorkerReport = serde_json::from_str(
            concat!(
                r#"{"kind":"heartbeat","task":3,"#,
                r#""counters":{"events_produced":10,"warnings":0}}"#,
            ),
        )
        .unwrap();
        assert_eq!(
            report,
            WorkerReport::Heartbeat {
                task: Some(TaskId(3)),
                counters: HeartbeatCounters {
                    events_produced: 10,
                    warnings: 0
                },
            }
        );
    }
}
