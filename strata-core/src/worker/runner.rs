use std::{
    fmt,
    io::Seek,
    sync::{
        Arc,
        mpsc::{self, SyncSender},
    },
    thread,
};

use strata_model::{EventSource, Record};
use thiserror::Error;
use tracing::{debug, warn};

use super::{
    heartbeat::WorkerProgress,
    protocol::{Assignment, TaskSummary},
};
use crate::{
    error::CoreError,
    parser::{EmitError, ParseOutcome, ParserTable, RecordEmitter},
    resolver::SourceResolver,
    segment::SegmentWriter,
};

/// Why an assignment produced no usable segment.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("worker was asked to stop")]
    Aborted,
    #[error("segment write failed: {0}")]
    Segment(#[from] CoreError),
}

/// Executes assignments: opens every source, runs the selected parsers, and
/// streams their records to the attempt's segment through a bounded channel
/// drained by a writer thread.
///
/// Shared by every worker flavour so that thread, process and inline
/// workers produce byte-identical segments for the same input.
#[derive(Clone)]
pub struct TaskRunner {
    parsers: ParserTable,
    resolver: Arc<dyn SourceResolver>,
    channel_capacity: usize,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("parsers", &self.parsers)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl TaskRunner {
    pub fn new(
        parsers: ParserTable,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        Self {
            parsers,
            resolver,
            channel_capacity: 256,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn parsers(&self) -> &ParserTable {
        &self.parsers
    }

    pub fn run(
        &self,
        assignment: &Assignment,
        progress: &WorkerProgress,
    ) -> Result<TaskSummary, TaskFailure> {
        let mut writer = SegmentWriter::create(&assignment.segment)?;
        let (tx, rx) = mpsc::sync_channel::<Record>(self.channel_capacity);

        let (parsed, written) = thread::scope(|scope| {
            let writer_thread = scope.spawn(
                move || -> Result<(SegmentWriter, u64), CoreError> {
                    let mut warnings = 0;
                    for record in rx {
                        if record.data_type.is_warning() {
                            warnings += 1;
                        }
                        writer.append(record)?;
                    }
                    Ok((writer, warnings))
                },
            );

            let parsed = self.parse_sources(assignment, &tx, progress);
            drop(tx);
            let written = writer_thread.join().unwrap_or_else(|_| {
                Err(CoreError::Internal("segment writer panicked".into()))
            });
            (parsed, written)
        });

        // A writer failure closes the channel, which shows up as SinkClosed on
        // the parsing side; the writer's error is the real cause.
        let (writer, warnings) = written?;
        if let Err(err) = parsed {
            debug!(
                task = %assignment.task_id,
                reason = %err,
                "assignment interrupted"
            );
            return Err(TaskFailure::Aborted);
        }

        let records = writer.seal()?;
        debug!(
            task = %assignment.task_id,
            attempt = assignment.attempt,
            records,
            warnings,
            "segment sealed"
        );
        Ok(TaskSummary { records, warnings })
    }

    fn parse_sources(
        &self,
        assignment: &Assignment,
        tx: &SyncSender<Record>,
        progress: &WorkerProgress,
    ) -> Result<(), EmitError> {
        for source in &assignment.sources {
            if progress.abort_requested() {
                return Err(EmitError::Aborted);
            }

            let mut handle = match self.resolver.open(source) {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(
                        task = %assignment.task_id,
                        source = %source,
                        error = %err,
                        "source unavailable"
                    );
                    let message = err.to_string();
                    self.warn(assignment, tx, progress, source, None, message)?;
                    continue;
                }
            };

            let selected = self.parsers.select(source);
            if selected.is_empty()
                && let Some(format) = source.format_hint()
            {
                self.warn(
                    assignment,
                    tx,
                    progress,
                    source,
                    None,
                    format!("no parser registered for format {format:?}"),
                )?;
                continue;
            }

            for parser in selected {
                let name = parser.name();
                if let Err(err) = handle.rewind() {
                    self.warn(
                        assignment,
                        tx,
                        progress,
                        source,
                        Some(name),
                        err.to_string(),
                    )?;
                    break;
                }

                let mut emitter = RecordEmitter::new(
                    tx,
                    assignment.task_id,
                    source,
                    name,
                    progress,
                );
                let outcome = parser.parse(source, &mut *handle, &mut emitter);
                if let Some(err) = emitter.interrupted() {
                    return Err(err);
                }

                match outcome {
                    ParseOutcome::NotApplicable | ParseOutcome::Success => {}
                    ParseOutcome::Warning(messages) => {
                        for message in messages {
                            self.warn(
                                assignment,
                                tx,
                                progress,
                                source,
                                Some(name),
                                message,
                            )?;
                        }
                    }
                    ParseOutcome::Fatal(err) => {
                        debug!(
                            task = %assignment.task_id,
                            source = %source,
                            parser = name,
                            error = %err,
                            "parser gave up on source"
                        );
                        self.warn(
                            assignment,
                            tx,
                            progress,
                            source,
                            Some(name),
                            err.message,
                        )?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn warn(
        &self,
        assignment: &Assignment,
        tx: &SyncSender<Record>,
        progress: &WorkerProgress,
        source: &EventSource,
        parser: Option<&str>,
        message: String,
    ) -> Result<(), EmitError> {
        let mut emitter = RecordEmitter::new(
            tx,
            assignment.task_id,
            source,
            parser.unwrap_or("strata"),
            progress,
        );
        emitter.emit(Record::extraction_warning(source, parser, message))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Read},
        path::PathBuf,
    };

    use strata_model::{AttributeValue, TaskId};

    use super::*;
    use crate::{
        parser::{Parser, ParserError},
        resolver::{ResolveError, SourceHandle, SourceRead},
        segment::read_segment,
    };

    /// Serves the file name as the file contents; names starting with
    /// `missing` do not resolve.
    struct EchoResolver;

    impl SourceResolver for EchoResolver {
        fn open(
            &self,
            source: &EventSource,
        ) -> Result<SourceHandle, ResolveError> {
            let name = source.location().to_string_lossy().into_owned();
            if name.contains("missing") {
                return Err(ResolveError::NotFound { path: name });
            }
            Ok(Box::new(Cursor::new(name.into_bytes())))
        }
    }

    /// `ok` inputs yield one record, `warn` inputs a warning, `fatal` a fatal
    /// error, everything else is not applicable.
    struct Scripted;

    impl Parser for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn parse(
            &self,
            _source: &EventSource,
            input: &mut dyn SourceRead,
            emitter: &mut RecordEmitter<'_>,
        ) -> ParseOutcome {
            let mut body = String::new();
            if let Err(err) = input.read_to_string(&mut body) {
                return ParseOutcome::Fatal(err.into());
            }
            if body.contains("ok") {
                let record = Record::of_type("test:ok")
                    .unwrap()
                    .with_attribute("body", body);
                return match emitter.emit(record) {
                    Ok(()) => ParseOutcome::Success,
                    Err(err) => ParseOutcome::Fatal(err.into()),
                };
            }
            if body.contains("warn") {
                return ParseOutcome::Warning(vec!["odd header".into()]);
            }
            if body.contains("fatal") {
                return ParseOutcome::Fatal(ParserError::new(
                    "unsupported version",
                ));
            }
            ParseOutcome::NotApplicable
        }
    }

    /// Always emits a record; used to check that a fatal error in the first
    /// parser skips the rest.
    struct Tail;

    impl Parser for Tail {
        fn name(&self) -> &str {
            "tail"
        }

        fn parse(
            &self,
            _source: &EventSource,
            _input: &mut dyn SourceRead,
            emitter: &mut RecordEmitter<'_>,
        ) -> ParseOutcome {
            match emitter.emit(Record::of_type("test:tail").unwrap()) {
                Ok(()) => ParseOutcome::Success,
                Err(err) => ParseOutcome::Fatal(err.into()),
            }
        }
    }

    const EXTRACTION: &str = strata_model::DataType::EXTRACTION_WARNING;

    fn runner() -> TaskRunner {
        let parsers = ParserTable::builder()
            .register("scripted", Scripted)
            .register("tail", Tail)
            .build()
            .unwrap();
        TaskRunner::new(parsers, Arc::new(EchoResolver))
            .with_channel_capacity(2)
    }

    fn assignment(dir: &std::path::Path, names: &[&str]) -> Assignment {
        Assignment {
            task_id: TaskId(1),
            attempt: 1,
            sources: names
                .iter()
                .map(|name| EventSource::file(*name))
                .collect(),
            segment: PathBuf::from(dir).join("task.seg"),
        }
    }

    fn kinds(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.data_type.as_str()).collect()
    }

    #[test]
    fn contains_per_source_failures() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = assignment(
            dir.path(),
            &["/ok-1", "/missing", "/warn", "/fatal", "/ok-2"],
        );
        let progress = WorkerProgress::default();

        let summary = runner().run(&assignment, &progress).unwrap();
        let records = read_segment(&assignment.segment).unwrap();

        assert_eq!(
            kinds(&records),
            vec![
                "test:ok",
                "test:tail",
                EXTRACTION,
                EXTRACTION,
                "test:tail",
                EXTRACTION,
                "test:ok",
                "test:tail",
            ]
        );
        assert_eq!(summary.records, 8);
        assert_eq!(summary.warnings, 3);
        assert!(records.iter().all(|r| r.task_id == Some(TaskId(1))));

        let fatal = &records[5];
        assert_eq!(
            fatal.attribute("parser"),
            Some(&AttributeValue::Text("scripted".into()))
        );
        assert_eq!(
            fatal.attribute("message"),
            Some(&AttributeValue::Text("unsupported version".into()))
        );
    }

    #[test]
    fn hinted_source_without_parser_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut assignment = assignment(dir.path(), &[]);
        assignment.sources =
            vec![EventSource::file("/ok").with_format_hint("nope")];

        let summary = runner()
            .run(&assignment, &WorkerProgress::default())
            .unwrap();
        assert_eq!(summary.warnings, 1);
    }

    #[test]
    fn abort_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = assignment(dir.path(), &["/ok"]);
        let progress = WorkerProgress::default();
        progress.request_abort();

        assert!(matches!(
            runner().run(&assignment, &progress),
            Err(TaskFailure::Aborted)
        ));
        assert!(read_segment(&assignment.segment).is_err());
    }
}
