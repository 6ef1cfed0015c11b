//! Child-process worker for the multi-process pool.
//!
//! Speaks JSON lines: control messages on stdin, reports on stdout. Logs go
//! to stderr so they never interleave with the protocol.

use std::{process::ExitCode, sync::Arc};

use strata_core::{FsResolver, ParserTable, TaskRunner, serve_stdio};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,strata_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runner =
        TaskRunner::new(ParserTable::builtin(), Arc::new(FsResolver::new()));
    match serve_stdio(runner) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "worker failed");
            ExitCode::FAILURE
        }
    }
}
