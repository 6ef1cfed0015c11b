//! The parser capability contract.
//!
//! Format-specific parsers live outside the engine. All the engine needs is
//! the [`Parser`] trait: read a bounded input handle, push zero or more
//! records through a [`RecordEmitter`], and report how it went with a typed
//! [`ParseOutcome`] instead of overloading errors for "not my format".
//!
//! Parsers are made available through an explicit [`ParserTable`] built at
//! startup and handed to the workers; there is no global registry.

use std::{
    fmt,
    sync::{Arc, mpsc::SyncSender},
};

use strata_model::{EventSource, Provenance, Record, TaskId};

use crate::{
    error::{CoreError, Result},
    resolver::SourceRead,
    worker::WorkerProgress,
};

pub trait Parser: Send + Sync {
    fn name(&self) -> &str;

    /// Parses one source. `input` is positioned at the start of the source.
    fn parse(
        &self,
        source: &EventSource,
        input: &mut dyn SourceRead,
        emitter: &mut RecordEmitter<'_>,
    ) -> ParseOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Signature did not match; nothing was emitted.
    NotApplicable,
    Success,
    /// Parsed, but some parts were skipped. Each message becomes an
    /// extraction warning record.
    Warning(Vec<String>),
    /// Gave up on this source. Remaining parsers for the source are skipped;
    /// the rest of the task continues.
    Fatal(ParserError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserError {
    pub message: String,
}

impl ParserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<EmitError> for ParserError {
    fn from(value: EmitError) -> Self {
        ParserError::new(value.to_string())
    }
}

impl From<std::io::Error> for ParserError {
    fn from(value: std::io::Error) -> Self {
        ParserError::new(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("segment writer is gone")]
    SinkClosed,
    #[error("worker is shutting down")]
    Aborted,
}

/// Streams records from a parser to the task's segment writer over a bounded
/// channel. A full channel blocks the parser, which is the backpressure
/// between parsing and disk.
pub struct RecordEmitter<'a> {
    sink: &'a SyncSender<Record>,
    task_id: TaskId,
    source: &'a EventSource,
    parser: &'a str,
    progress: &'a WorkerProgress,
    emitted: u64,
    interrupted: Option<EmitError>,
}

impl fmt::Debug for RecordEmitter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordEmitter")
            .field("task_id", &self.task_id)
            .field("source", &self.source.display_name())
            .field("parser", &self.parser)
            .field("emitted", &self.emitted)
            .field("interrupted", &self.interrupted)
            .finish()
    }
}

impl<'a> RecordEmitter<'a> {
    pub fn new(
        sink: &'a SyncSender<Record>,
        task_id: TaskId,
        source: &'a EventSource,
        parser: &'a str,
        progress: &'a WorkerProgress,
    ) -> Self {
        Self {
            sink,
            task_id,
            source,
            parser,
            progress,
            emitted: 0,
            interrupted: None,
        }
    }

    /// Stamps task and provenance, then hands the record to the writer.
    pub fn emit(
        &mut self,
        mut record: Record,
    ) -> std::result::Result<(), EmitError> {
        if let Some(err) = self.interrupted {
            return Err(err);
        }
        if self.progress.abort_requested() {
            self.interrupted = Some(EmitError::Aborted);
            return Err(EmitError::Aborted);
        }

        record.task_id = Some(self.task_id);
        if record.provenance.is_none() {
            record.provenance = Some(Provenance {
                source: self.source.clone(),
                parser: self.parser.to_string(),
            });
        }
        let is_warning = record.data_type.is_warning();

        if self.sink.send(record).is_err() {
            self.interrupted = Some(EmitError::SinkClosed);
            return Err(EmitError::SinkClosed);
        }

        if is_warning {
            self.progress.record_warning();
        } else {
            self.progress.record_produced();
        }
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Set when the writer went away or the worker is aborting; the task
    /// cannot complete in either case.
    pub fn interrupted(&self) -> Option<EmitError> {
        self.interrupted
    }
}

/// Format identifier to parser mapping, in registration order.
#[derive(Clone, Default)]
pub struct ParserTable {
    entries: Vec<(String, Arc<dyn Parser>)>,
}

impl fmt::Debug for ParserTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(format, _)| format))
            .finish()
    }
}

impl ParserTable {
    pub fn builder() -> ParserTableBuilder {
        ParserTableBuilder::default()
    }

    /// The reference parsers shipped with the engine.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                (
                    crate::parsers::TimestampedLinesParser::FORMAT.to_string(),
                    Arc::new(crate::parsers::TimestampedLinesParser),
                ),
                (
                    crate::parsers::JsonEventsParser::FORMAT.to_string(),
                    Arc::new(crate::parsers::JsonEventsParser),
                ),
            ],
        }
    }

    pub fn get(&self, format: &str) -> Option<&Arc<dyn Parser>> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == format)
            .map(|(_, parser)| parser)
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(format, _)| format.as_str())
    }

    /// Parsers to run for a source: the hinted one only, or every registered
    /// parser in order when the source carries no hint.
    pub fn select(&self, source: &EventSource) -> Vec<&Arc<dyn Parser>> {
        match source.format_hint() {
            Some(format) => self.get(format).into_iter().collect(),
            None => self.entries.iter().map(|(_, parser)| parser).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
pub struct ParserTableBuilder {
    entries: Vec<(String, Arc<dyn Parser>)>,
    duplicate: Option<String>,
}

impl fmt::Debug for ParserTableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserTableBuilder")
            .field("formats", &self.entries.len())
            .field("duplicate", &self.duplicate)
            .finish()
    }
}

impl ParserTableBuilder {
    pub fn register(
        self,
        format: impl Into<String>,
        parser: impl Parser + 'static,
    ) -> Self {
        self.register_shared(format, Arc::new(parser))
    }

    pub fn register_shared(
        mut self,
        format: impl Into<String>,
        parser: Arc<dyn Parser>,
    ) -> Self {
        let format = format.into();
        if self.entries.iter().any(|(existing, _)| *existing == format) {
            self.duplicate.get_or_insert(format);
        } else {
            self.entries.push((format, parser));
        }
        self
    }

    pub fn build(self) -> Result<ParserTable> {
        if let Some(format) = self.duplicate {
            return Err(CoreError::DuplicateParser(format));
        }
        Ok(ParserTable {
            entries: self.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    struct Named(&'static str);

    impl Parser for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn parse(
            &self,
            _source: &EventSource,
            _input: &mut dyn SourceRead,
            _emitter: &mut RecordEmitter<'_>,
        ) -> ParseOutcome {
            ParseOutcome::Success
        }
    }

    #[test]
    fn duplicate_formats_are_rejected() {
        let err = ParserTable::builder()
            .register("a", Named("a"))
            .register("a", Named("again"))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::DuplicateParser(format) if format == "a"
        ));
    }

    #[test]
    fn hint_selects_a_single_parser() {
        let table = ParserTable::builder()
            .register("a", Named("a"))
            .register("b", Named("b"))
            .build()
            .unwrap();

        let hinted = EventSource::file("/x").with_format_hint("b");
        let names: Vec<_> =
            table.select(&hinted).iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["b"]);

        let unhinted = EventSource::file("/x");
        assert_eq!(table.select(&unhinted).len(), 2);

        let unknown = EventSource::file("/x").with_format_hint("zzz");
        assert!(table.select(&unknown).is_empty());
    }

    #[test]
    fn emitter_stamps_task_and_provenance() {
        let (tx, rx) = mpsc::sync_channel(4);
        let progress = WorkerProgress::default();
        let source = EventSource::file("/evidence/a");
        let mut emitter =
            RecordEmitter::new(&tx, TaskId(9), &source, "demo", &progress);

        emitter.emit(Record::of_type("test:a").unwrap()).unwrap();
        let record = rx.recv().unwrap();
        assert_eq!(record.task_id, Some(TaskId(9)));
        assert_eq!(record.provenance.unwrap().parser, "demo");
        assert_eq!(progress.counters().events_produced, 1);
    }

    #[test]
    fn emitter_reports_closed_sink() {
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);
        let progress = WorkerProgress::default();
        let source = EventSource::file("/evidence/a");
        let mut emitter =
            RecordEmitter::new(&tx, TaskId(1), &source, "demo", &progress);

        assert_eq!(
            emitter.emit(Record::of_type("test:a").unwrap()),
            Err(EmitError::SinkClosed)
        );
        assert_eq!(emitter.interrupted(), Some(EmitError::SinkClosed));
    }
}
