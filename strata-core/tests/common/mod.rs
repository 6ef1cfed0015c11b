#![allow(dead_code)]

use std::{
    io::Cursor,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use strata_core::{
    EventSource, Foreman, ForemanConfig, LocalSourceQueue, OutputStore,
    ParseOutcome, Parser, ParserError, ParserTable, RecordEmitter, SegmentDir,
    SourceQueue, TaskRunner,
    resolver::{ResolveError, SourceHandle, SourceRead, SourceResolver},
    store::StoredRecord,
    worker::WorkerLauncher,
};
use strata_model::{DataType, Record, Timestamp, TimestampDesc};

/// Serves each source's file name as its content.
pub struct NameResolver;

impl SourceResolver for NameResolver {
    fn open(&self, source: &EventSource) -> Result<SourceHandle, ResolveError> {
        Ok(Box::new(Cursor::new(file_name(source).into_bytes())))
    }
}

pub fn file_name(source: &EventSource) -> String {
    source
        .location()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Test parser driven by source names:
///
/// - `fail*` gives up with a fatal parser error,
/// - `crash*` panics the first time any worker sees one,
/// - `slow*` sleeps for `slow_delay` before emitting,
/// - anything else emits one `test:<name>` record.
#[derive(Default)]
pub struct ScriptedParser {
    pub slow_delay: Duration,
    pub crashed: Arc<AtomicBool>,
}

impl Parser for ScriptedParser {
    fn name(&self) -> &str {
        "scripted"
    }

    fn parse(
        &self,
        source: &EventSource,
        _input: &mut dyn SourceRead,
        emitter: &mut RecordEmitter<'_>,
    ) -> ParseOutcome {
        let name = file_name(source);
        if name.starts_with("fail") {
            return ParseOutcome::Fatal(ParserError::new("unreadable header"));
        }
        if name.starts_with("crash")
            && !self.crashed.swap(true, Ordering::SeqCst)
        {
            panic!("parser crashed on {name}");
        }
        if name.starts_with("slow") {
            std::thread::sleep(self.slow_delay);
        }

        let data_type = match DataType::new(format!("test:{name}")) {
            Ok(data_type) => data_type,
            Err(err) => {
                return ParseOutcome::Fatal(ParserError::new(err.to_string()));
            }
        };
        let record = Record::new(data_type)
            .with_attribute("name", name.as_str())
            .with_timestamp(
                Timestamp::from_micros(1_700_000_000_000_000),
                TimestampDesc::new(TimestampDesc::WRITTEN),
            );
        match emitter.emit(record) {
            Ok(()) => ParseOutcome::Success,
            Err(err) => ParseOutcome::Fatal(err.into()),
        }
    }
}

pub fn runner(parser: ScriptedParser) -> TaskRunner {
    let parsers = ParserTable::builder()
        .register("test/scripted", parser)
        .build()
        .expect("parser table");
    TaskRunner::new(parsers, Arc::new(NameResolver))
}

pub fn config(workers: usize, sources_per_task: usize) -> ForemanConfig {
    let mut config = ForemanConfig::default();
    config.pool.workers = workers;
    config.tasks.sources_per_task = sources_per_task;
    config.heartbeat.interval_ms = 25;
    config.heartbeat.timeout_ms = 400;
    config.heartbeat.check_interval_ms = 25;
    config.shutdown.grace_ms = 200;
    config
}

pub fn sources(names: &[&str]) -> Vec<EventSource> {
    names
        .iter()
        .map(|name| EventSource::file(format!("/evidence/{name}")))
        .collect()
}

/// A closed queue holding `names`, in order.
pub fn closed_queue(names: &[&str]) -> LocalSourceQueue {
    let queue = LocalSourceQueue::from_sources(sources(names));
    queue.close();
    queue
}

pub async fn start<S: OutputStore>(
    config: ForemanConfig,
    launcher: Arc<dyn WorkerLauncher>,
    store: S,
    dir: &Path,
) -> Foreman<S> {
    let segments =
        SegmentDir::create(dir.join("segments")).expect("segment dir");
    Foreman::start(config, launcher, store, segments, None)
        .await
        .expect("foreman start")
}

/// `(task id, data type)` for every stored record.
pub fn layout(records: &[StoredRecord]) -> Vec<(u64, String)> {
    records
        .iter()
        .map(|stored| {
            let data_type = stored.record.data_type.as_str().to_string();
            (stored.task_id.get(), data_type)
        })
        .collect()
}

pub fn data_types(records: &[StoredRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|stored| !stored.record.data_type.is_warning())
        .map(|stored| stored.record.data_type.as_str().to_string())
        .collect()
}

pub fn count_of(records: &[StoredRecord], data_type: &str) -> usize {
    records
        .iter()
        .filter(|stored| stored.record.data_type.as_str() == data_type)
        .count()
}
