//! Extracts a timeline from one or more mounted evidence directories.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use strata_config::{
    OutputConfig, StrataConfig, StrataConfigSource, init_tracing,
};
use strata_core::{
    BoundedSourceQueue, CoreError, ExecutionMode, FileStore, Foreman,
    FsResolver, InlineLauncher, ParserTable, ProcessLauncher, RunSummary,
    SegmentDir, SourceQueue, TaskJournal, TaskRunner, ThreadLauncher,
    WorkerLauncher, WorkerSettings, collect_directory,
};
use strata_model::RunId;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "strata-extract", about = "Strata timeline extraction")]
struct Cli {
    /// Directories to walk for event sources. A resumed run takes its
    /// sources from the journal instead.
    #[arg(required_unless_present = "resume", conflicts_with = "resume")]
    dirs: Vec<PathBuf>,
    /// TOML or JSON config file; overrides $STRATA_CONFIG_PATH
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for the store, segments and journal
    #[arg(long)]
    output: Option<PathBuf>,
    /// Continue an interrupted run from its journal
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    workers: Option<usize>,
    /// Run every task inline on the foreman
    #[arg(long)]
    single_threaded: bool,
    /// Use worker threads instead of child processes
    #[arg(long, conflicts_with = "single_threaded")]
    threads: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing("info")?;
    let cli = Cli::parse();

    let (mut config, source) = match &cli.config {
        Some(path) => (
            StrataConfig::load_from_file(path)?,
            StrataConfigSource::File(path.clone()),
        ),
        None => StrataConfig::load_from_env()?,
    };
    info!(?source, "configuration loaded");

    if let Some(dir) = &cli.output {
        let journal = config.output.journal;
        config.output = OutputConfig::rooted_at(dir);
        config.output.journal = journal;
    }
    if let Some(workers) = cli.workers {
        config.foreman.pool.workers = workers;
    }
    if cli.single_threaded {
        config.foreman.pool.mode = ExecutionMode::SingleThreaded;
    }
    config.validate()?;

    let launcher = launcher(&config, cli.threads);
    let store = FileStore::open(&config.output.store_path)?;
    let segments = SegmentDir::create(&config.output.segments_dir)?;
    let journal_path = &config.output.journal_path;

    let mut foreman = if cli.resume {
        if !config.output.journal || !journal_path.exists() {
            bail!("no journal at {} to resume from", journal_path.display());
        }
        Foreman::resume(
            config.foreman.clone(),
            launcher,
            store,
            segments,
            journal_path,
        )
        .await?
    } else {
        let journal = if config.output.journal {
            if journal_path.exists() {
                bail!(
                    "{} already exists; pass --resume to continue that run \
                     or remove it",
                    journal_path.display()
                );
            }
            Some(TaskJournal::open(journal_path, RunId::new())?)
        } else {
            None
        };
        Foreman::start(
            config.foreman.clone(),
            launcher,
            store,
            segments,
            journal,
        )
        .await?
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; shutting down");
                shutdown.cancel();
            }
        }
    });

    let queue = BoundedSourceQueue::new(config.foreman.queue.capacity);
    let walk = async {
        let outcome = walk_all(&cli.dirs, &queue).await;
        queue.close();
        outcome
    };
    let (walked, summary) =
        tokio::join!(walk, foreman.run(&queue, shutdown.clone()));
    let summary = summary.context("extraction run failed")?;
    foreman.into_store().await;
    walked?;

    report(&summary);
    Ok(if summary.interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

fn runner() -> TaskRunner {
    TaskRunner::new(ParserTable::builtin(), Arc::new(FsResolver::new()))
}

fn launcher(config: &StrataConfig, threads: bool) -> Arc<dyn WorkerLauncher> {
    let foreman = &config.foreman;
    if foreman.pool.mode == ExecutionMode::SingleThreaded {
        return Arc::new(InlineLauncher::new(runner()));
    }
    if !threads {
        match config.worker.resolve_program() {
            Some(program) => {
                info!(
                    program = %program.display(),
                    "using child process workers"
                );
                return Arc::new(ProcessLauncher::new(
                    program,
                    WorkerSettings::from_config(foreman),
                ));
            }
            None => warn!(
                "worker program not found; falling back to thread workers"
            ),
        }
    }
    Arc::new(ThreadLauncher::new(runner(), foreman.heartbeat.interval()))
}

async fn walk_all<Q>(dirs: &[PathBuf], queue: &Q) -> Result<()>
where
    Q: SourceQueue + ?Sized,
{
    for dir in dirs {
        match collect_directory(dir, queue).await {
            Ok(walked) => info!(
                root = %dir.display(),
                sources = walked.sources,
                skipped = walked.skipped,
                "directory walk finished"
            ),
            // Shutdown closed the queue under the walk.
            Err(CoreError::QueueClosed) => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("walking {}", dir.display()));
            }
        }
    }
    Ok(())
}

fn report(summary: &RunSummary) {
    info!(
        tasks = summary.tasks_created,
        merged = summary.merged,
        failed = summary.failed,
        abandoned_attempts = summary.abandoned_attempts,
        records = summary.records,
        duplicates_dropped = summary.duplicates_dropped,
        "extraction finished"
    );
    if summary.interrupted {
        warn!(
            unfinished_tasks = summary.unfinished_tasks,
            deferred_sources = summary.deferred_sources,
            "run was interrupted; pass --resume to finish it"
        );
    }
}
