//! Reference parsers shipped with the engine.
//!
//! Real deployments register their own format parsers through
//! [`ParserTable::builder`](crate::parser::ParserTable::builder). These two
//! cover plain text logs and JSON event dumps, which is enough to run the
//! pipeline end to end on a mounted directory.

mod json_events;
mod timestamped_lines;

pub use json_events::JsonEventsParser;
pub use timestamped_lines::TimestampedLinesParser;
