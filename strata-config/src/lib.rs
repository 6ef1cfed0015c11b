//! Configuration loading for the Strata extraction runner.
//!
//! [`StrataConfig`] wraps the engine's [`ForemanConfig`] with the paths a
//! full run needs. Overrides are read from a TOML or JSON file, from inline
//! JSON in the environment, or fall back to defaults.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use strata_core::{ExecutionMode, ForemanConfig};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const CONFIG_PATH_ENV: &str = "STRATA_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "STRATA_CONFIG_JSON";

const CANDIDATES: &[&str] = &[
    "strata.toml",
    "strata.json",
    "config/strata.toml",
    "config/strata.json",
];

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StrataConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Settings for one extraction run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Engine tuning: pool size and mode, heartbeats, task sizing, queue
    /// capacity and shutdown grace.
    pub foreman: ForemanConfig,
    /// Where committed records, segments and the task journal live.
    pub output: OutputConfig,
    /// Child-process worker settings.
    pub worker: WorkerProgramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Append-only JSON-lines store holding the merged timeline.
    pub store_path: PathBuf,
    /// Scratch directory for per-attempt segments.
    pub segments_dir: PathBuf,
    /// Whether task and queue state is journaled so an interrupted run can
    /// be resumed. Without it, unfinished work is reported as failed.
    pub journal: bool,
    pub journal_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("strata-out/timeline.jsonl"),
            segments_dir: PathBuf::from("strata-out/segments"),
            journal: true,
            journal_path: PathBuf::from("strata-out/journal.jsonl"),
        }
    }
}

impl OutputConfig {
    /// Re-roots every output path under `dir`.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            store_path: dir.join("timeline.jsonl"),
            segments_dir: dir.join("segments"),
            journal: true,
            journal_path: dir.join("journal.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerProgramConfig {
    /// Path to the `strata-worker` binary. When unset, the binary next to
    /// the running executable is used.
    pub program: Option<PathBuf>,
}

impl WorkerProgramConfig {
    /// The worker program to spawn, if one exists on disk.
    pub fn resolve_program(&self) -> Option<PathBuf> {
        let candidate = match &self.program {
            Some(program) => program.clone(),
            None => {
                let exe = env::current_exe().ok()?;
                exe.parent()?
                    .join(format!("strata-worker{}", env::consts::EXE_SUFFIX))
            }
        };
        candidate.is_file().then_some(candidate)
    }
}

/// Settings that cannot produce a working run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("foreman.pool.workers must be at least 1")]
    ZeroWorkers,
    #[error("foreman.queue.capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("foreman.tasks.sources_per_task must be at least 1")]
    ZeroSourcesPerTask,
    #[error("foreman.tasks.max_attempts must be at least 1")]
    ZeroMaxAttempts,
    #[error(
        "foreman.heartbeat.timeout_ms ({timeout_ms}) must be larger than \
         heartbeat.interval_ms ({interval_ms})"
    )]
    HeartbeatTimeout { timeout_ms: u64, interval_ms: u64 },
}

impl StrataConfig {
    /// Load configuration overrides using environment variables.
    /// Evaluation order:
    /// 1) `$STRATA_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$STRATA_CONFIG_JSON` (inline JSON),
    /// 3) the first default file found in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, StrataConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, StrataConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, StrataConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file_in(Path::new("")) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, StrataConfigSource::File(path)));
        }

        Ok((Self::default(), StrataConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") | Some("tml") => {
                toml::from_str(&contents).map_err(|err| {
                    anyhow!("invalid config {}: {}", path.display(), err)
                })
            }
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(
        contents: &str,
        origin: &str,
    ) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid config json: {err}"))
    }

    /// First of the conventional config file names that exists under `base`.
    pub fn find_default_file_in(base: &Path) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|path| path.is_file())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let foreman = &self.foreman;
        if foreman.pool.mode == ExecutionMode::Pool && foreman.pool.workers == 0
        {
            return Err(ConfigError::ZeroWorkers);
        }
        if foreman.queue.capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if foreman.tasks.sources_per_task == 0 {
            return Err(ConfigError::ZeroSourcesPerTask);
        }
        if foreman.tasks.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if foreman.heartbeat.timeout_ms <= foreman.heartbeat.interval_ms {
            return Err(ConfigError::HeartbeatTimeout {
                timeout_ms: foreman.heartbeat.timeout_ms,
                interval_ms: foreman.heartbeat.interval_ms,
            });
        }
        Ok(())
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over
/// `default_filter` when set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StrataConfig::default().validate().unwrap();
    }

    #[test]
    fn single_threaded_mode_ignores_worker_count() {
        let mut config = StrataConfig::default();
        config.foreman.pool.workers = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));

        config.foreman.pool.mode = ExecutionMode::SingleThreaded;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn explicit_program_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("strata-worker");
        let config = WorkerProgramConfig {
            program: Some(program.clone()),
        };
        assert_eq!(config.resolve_program(), None);

        fs::write(&program, b"").unwrap();
        assert_eq!(config.resolve_program(), Some(program));
    }
}
