use thiserror::Error;

use crate::{ids::TaskId, task::TaskState};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid data type: {0:?}")]
    InvalidDataType(String),

    #[error("invalid event source: {0}")]
    InvalidSource(String),

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

pub type Result<T> = std::result::Result<T, ModelError>;
