use std::{sync::Arc, time::Duration};

use strata_core::{
    BoundedSourceQueue, EventSource, Foreman, ForemanConfig, MemoryStore,
    ProcessLauncher, SegmentDir, SourceQueue, TaskId, TaskOutcome,
    WorkerSettings, collect_directory,
};
use strata_model::DataType;
use tokio_util::sync::CancellationToken;

const WORKER: &str = env!("CARGO_BIN_EXE_strata-worker");

fn config() -> ForemanConfig {
    let mut config = ForemanConfig::default();
    config.pool.workers = 2;
    config.tasks.sources_per_task = 1;
    config.heartbeat.interval_ms = 50;
    config.heartbeat.timeout_ms = 5_000;
    config.heartbeat.check_interval_ms = 100;
    config
}

async fn start(
    dir: &std::path::Path,
    store: MemoryStore,
) -> Foreman<MemoryStore> {
    let config = config();
    let settings = WorkerSettings::from_config(&config);
    let launcher = Arc::new(ProcessLauncher::new(WORKER, settings));
    Foreman::start(
        config,
        launcher,
        store,
        SegmentDir::create(dir.join("segments")).unwrap(),
        None,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn child_processes_extract_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let evidence = dir.path().join("evidence");
    std::fs::create_dir_all(evidence.join("logs")).unwrap();
    std::fs::write(
        evidence.join("events.jsonl"),
        concat!(
            r#"{"timestamp_us":1709287200000000,"#,
            r#""data_type":"app:login","user":"alice"}"#,
            "\n",
            r#"{"timestamp_us":1709287260000000,"#,
            r#""data_type":"app:logout","user":"alice"}"#,
            "\n",
        ),
    )
    .unwrap();
    std::fs::write(
        evidence.join("logs/app.log"),
        "2024-03-01T10:00:00Z service started\n\
         garbage without a timestamp\n\
         2024-03-01T10:05:00Z service stopped\n",
    )
    .unwrap();

    let store = MemoryStore::new();
    let mut foreman = start(dir.path(), store.clone()).await;
    assert!(
        foreman
            .worker_statuses()
            .iter()
            .all(|status| status.pid.is_some())
    );

    let queue = BoundedSourceQueue::new(4);
    let walk = async {
        let walked = collect_directory(&evidence, &queue).await;
        queue.close();
        walked
    };
    let (walked, summary) =
        tokio::join!(walk, foreman.run(&queue, CancellationToken::new()));
    assert_eq!(walked.unwrap().sources, 2);
    let summary = summary.unwrap();
    assert_eq!(summary.merged, 2);

    let records = store.records();
    let layout: Vec<_> = records
        .iter()
        .map(|stored| {
            (stored.task_id, stored.record.data_type.as_str().to_string())
        })
        .collect();
    assert_eq!(
        layout,
        vec![
            (TaskId(1), "app:login".to_string()),
            (TaskId(1), "app:logout".to_string()),
            (TaskId(2), "text:log:line".to_string()),
            (TaskId(2), "text:log:line".to_string()),
            (TaskId(2), DataType::EXTRACTION_WARNING.to_string()),
        ]
    );
    let provenance = records[0].record.provenance.as_ref().unwrap();
    assert_eq!(provenance.parser, "json_events");
}

#[tokio::test]
async fn unresolvable_sources_become_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let mut foreman = start(dir.path(), store.clone()).await;

    let queue = BoundedSourceQueue::new(4);
    queue
        .enqueue(EventSource::file(dir.path().join("does-not-exist.log")))
        .await
        .unwrap();
    queue.close();

    let run = foreman.run(&queue, CancellationToken::new());
    let summary = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.merged, 1);
    assert_eq!(foreman.outcome(TaskId(1)), Some(TaskOutcome::Merged));
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].record.data_type.is_warning());
}
