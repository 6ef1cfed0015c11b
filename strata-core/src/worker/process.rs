use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use strata_model::WorkerId;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    Assignment, ControlMessage, TaskRunner, WorkerEvent, WorkerHandle,
    WorkerLauncher, WorkerReport, WorkerSettings,
    heartbeat::{WorkerProgress, spawn_heartbeat},
    report_for,
};
use crate::error::{CoreError, Result};

const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs each worker as a child process (normally the `strata-worker`
/// binary). Killing the child is a hard stop, so a stalled worker never
/// outlives its timeout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    settings: WorkerSettings,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, settings: WorkerSettings) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            settings,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

async fn write_message(
    stdin: &mut ChildStdin,
    message: &ControlMessage,
) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

async fn forward_reports(
    worker: WorkerId,
    stdout: ChildStdout,
    events: UnboundedSender<WorkerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<WorkerReport>(&line) {
            Ok(report) => {
                if events.send(WorkerEvent { worker, report }).is_err() {
                    break;
                }
            }
            Err(err) => warn!(
                worker = %worker,
                error = %err,
                "unparseable worker report"
            ),
        }
    }
    debug!(worker = %worker, "worker stdout closed");
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let unavailable = |reason: String| CoreError::WorkerUnavailable {
            worker: id,
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                let program = self.program.display();
                unavailable(format!("failed to spawn {program}: {err}"))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("child stdout not captured".into()))?;

        write_message(
            &mut stdin,
            &ControlMessage::Configure {
                worker: id,
                settings: self.settings,
            },
        )
        .await
        .map_err(|err| {
            unavailable(format!("failed to configure worker: {err}"))
        })?;

        let pid = child.id();
        let reader = tokio::spawn(forward_reports(id, stdout, events));
        info!(
            worker = %id,
            pid = ?pid,
            program = %self.program.display(),
            "process worker started"
        );

        Ok(Box::new(ProcessWorker {
            id,
            pid,
            child,
            stdin: Some(stdin),
            reader,
        }))
    }
}

#[derive(Debug)]
struct ProcessWorker {
    id: WorkerId,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

impl ProcessWorker {
    async fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(
                worker = %self.id,
                error = %err,
                "kill failed; child already gone"
            );
        }
        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker = %self.id, %status, "child reaped")
            }
            Ok(Err(err)) => {
                warn!(worker = %self.id, error = %err, "failed to reap child")
            }
            Err(_) => {
                error!(worker = %self.id, "child did not exit after kill")
            }
        }
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn emits_heartbeats(&self) -> bool {
        true
    }

    async fn assign(&mut self, assignment: Assignment) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CoreError::WorkerUnavailable {
                worker: self.id,
                reason: "worker was stopped".into(),
            })?;
        write_message(stdin, &ControlMessage::Assign { assignment })
            .await
            .map_err(|err| CoreError::WorkerUnavailable {
                worker: self.id,
                reason: format!("failed to send assignment: {err}"),
            })
    }

    async fn terminate(&mut self) {
        self.stdin = None;
        self.kill().await;
        self.reader.abort();
        warn!(worker = %self.id, "process worker terminated");
    }

    async fn shutdown(&mut self) {
        if let Some(mut stdin) = self.stdin.take()
            && let Err(err) =
                write_message(&mut stdin, &ControlMessage::Shutdown).await
        {
            debug!(
                worker = %self.id,
                error = %err,
                "shutdown message not delivered"
            );
        }

        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker = %self.id, %status, "process worker exited")
            }
            Ok(Err(err)) => warn!(
                worker = %self.id,
                error = %err,
                "failed to wait for worker"
            ),
            Err(_) => {
                warn!(worker = %self.id, "worker ignored shutdown; killing");
                self.kill().await;
            }
        }
        self.reader.abort();
    }
}

fn write_report(report: &WorkerReport) -> io::Result<()> {
    let mut line = serde_json::to_vec(report)?;
    line.push(b'\n');
    let mut out = io::stdout().lock();
    out.write_all(&line)?;
    out.flush()
}

/// Child side of [`ProcessLauncher`]: reads control messages from stdin,
/// writes reports to stdout, and heartbeats from a separate thread until
/// stdin closes or a shutdown message arrives.
pub fn serve_stdio(runner: TaskRunner) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    let (worker, settings) = match lines.next() {
        Some(line) => match serde_json::from_str::<ControlMessage>(&line?)? {
            ControlMessage::Configure { worker, settings } => {
                (worker, settings)
            }
            other => {
                return Err(CoreError::Internal(format!(
                    "expected configure message, got {other:?}"
                )));
            }
        },
        None => return Ok(()),
    };

    let runner = runner.with_channel_capacity(settings.record_channel_capacity);
    let progress = Arc::new(WorkerProgress::default());
    let alive = Arc::new(AtomicBool::new(true));

    write_report(&WorkerReport::Ready {
        pid: std::process::id(),
    })?;
    let heartbeat = spawn_heartbeat(
        worker,
        settings.heartbeat_interval(),
        Arc::clone(&progress),
        Arc::clone(&alive),
        |task, counters| {
            write_report(&WorkerReport::Heartbeat { task, counters }).is_ok()
        },
    )?;
    info!(worker = %worker, "serving assignments");

    for line in lines {
        let message: ControlMessage = serde_json::from_str(&line?)?;
        match message {
            ControlMessage::Assign { assignment } => {
                progress.begin(assignment.task_id);
                write_report(&WorkerReport::Heartbeat {
                    task: Some(assignment.task_id),
                    counters: progress.counters(),
                })?;
                let result = runner.run(&assignment, &progress);
                progress.finish();
                write_report(&report_for(&assignment, result))?;
            }
            ControlMessage::Shutdown => break,
            ControlMessage::Configure { .. } => {
                warn!(worker = %worker, "ignoring repeated configure message");
            }
        }
    }

    alive.store(false, Ordering::Release);
    heartbeat.thread().unpark();
    let _ = heartbeat.join();
    info!(worker = %worker, "worker exiting");
    Ok(())
}
