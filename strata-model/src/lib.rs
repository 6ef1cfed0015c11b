//! Core data model definitions shared across Strata crates.
//!
//! Everything in here is plain data: identifiers, the discovered
//! [`EventSource`], the normalized [`Record`] envelope the merge engine moves
//! around, and the [`TaskState`] lifecycle. None of it performs I/O.

pub mod error;
pub mod ids;
pub mod record;
pub mod source;
pub mod task;
pub mod timestamp;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{RunId, TaskId, WorkerId};
pub use record::{
    AttributeValue, DataType, Provenance, Record, RecordTimestamp,
};
pub use source::{EventSource, SourceKind};
pub use task::{TaskOutcome, TaskState};
pub use timestamp::{Timestamp, TimestampDesc};
