use std::{
    fs,
    sync::{Mutex, MutexGuard},
};

use strata_config::{
    CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigError, StrataConfig,
    StrataConfigSource,
};
use strata_core::ExecutionMode;
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clear_env() {
    for key in [CONFIG_PATH_ENV, CONFIG_JSON_ENV] {
        unsafe { std::env::remove_var(key) };
    }
}

#[test]
fn env_path_takes_precedence_over_inline_json() {
    let _guard = lock_env();
    clear_env();

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("run.toml");
    fs::write(
        &path,
        r#"
[foreman.pool]
workers = 6

[foreman.tasks]
sources_per_task = 3

[output]
journal = false
"#,
    )
    .unwrap();

    unsafe {
        std::env::set_var(CONFIG_PATH_ENV, &path);
        std::env::set_var(
            CONFIG_JSON_ENV,
            r#"{"foreman":{"pool":{"workers":2}}}"#,
        );
    }
    let (config, source) = StrataConfig::load_from_env().expect("load");
    clear_env();

    assert_eq!(source, StrataConfigSource::EnvPath(path));
    assert_eq!(config.foreman.pool.workers, 6);
    assert_eq!(config.foreman.tasks.sources_per_task, 3);
    assert_eq!(config.foreman.tasks.max_attempts, 3);
    assert!(!config.output.journal);
}

#[test]
fn inline_json_is_used_when_no_path_is_set() {
    let _guard = lock_env();
    clear_env();

    unsafe {
        std::env::set_var(
            CONFIG_JSON_ENV,
            concat!(
                r#"{"foreman":{"pool":{"mode":"single_threaded"},"#,
                r#""heartbeat":{"timeout_ms":9000}}}"#,
            ),
        );
    }
    let (config, source) = StrataConfig::load_from_env().expect("load");
    clear_env();

    assert_eq!(source, StrataConfigSource::EnvInline);
    assert_eq!(config.foreman.pool.mode, ExecutionMode::SingleThreaded);
    assert_eq!(config.foreman.heartbeat.timeout_ms, 9_000);
    assert_eq!(config.foreman.heartbeat.interval_ms, 1_000);
}

#[test]
fn malformed_inline_json_is_an_error() {
    let _guard = lock_env();
    clear_env();

    unsafe { std::env::set_var(CONFIG_JSON_ENV, "{not json") };
    let err = StrataConfig::load_from_env().unwrap_err();
    clear_env();

    assert!(format!("{err:#}").contains(CONFIG_JSON_ENV));
}

#[test]
fn extensionless_files_accept_toml_or_json() {
    let dir = tempdir().expect("tempdir");

    let toml_path = dir.path().join("as-toml");
    fs::write(&toml_path, "[foreman.queue]\ncapacity = 16\n").unwrap();
    let config = StrataConfig::load_from_file(&toml_path).unwrap();
    assert_eq!(config.foreman.queue.capacity, 16);

    let json_path = dir.path().join("as-json");
    fs::write(&json_path, r#"{"foreman":{"queue":{"capacity":32}}}"#).unwrap();
    let config = StrataConfig::load_from_file(&json_path).unwrap();
    assert_eq!(config.foreman.queue.capacity, 32);

    let junk_path = dir.path().join("junk");
    fs::write(&junk_path, "capacity: [").unwrap();
    let err = StrataConfig::load_from_file(&junk_path).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("toml error"));
    assert!(message.contains("json error"));
}

#[test]
fn default_candidates_prefer_the_working_directory() {
    let dir = tempdir().expect("tempdir");
    assert_eq!(StrataConfig::find_default_file_in(dir.path()), None);

    fs::create_dir_all(dir.path().join("config")).unwrap();
    fs::write(dir.path().join("config/strata.json"), "{}").unwrap();
    assert_eq!(
        StrataConfig::find_default_file_in(dir.path()),
        Some(dir.path().join("config/strata.json"))
    );

    fs::write(dir.path().join("strata.toml"), "").unwrap();
    assert_eq!(
        StrataConfig::find_default_file_in(dir.path()),
        Some(dir.path().join("strata.toml"))
    );
}

#[test]
fn validation_rejects_unrunnable_settings() {
    let mut config = StrataConfig::default();
    config.foreman.queue.capacity = 0;
    assert_eq!(config.validate(), Err(ConfigError::ZeroQueueCapacity));

    let mut config = StrataConfig::default();
    config.foreman.tasks.sources_per_task = 0;
    assert_eq!(config.validate(), Err(ConfigError::ZeroSourcesPerTask));

    let mut config = StrataConfig::default();
    config.foreman.heartbeat.interval_ms = 2_000;
    config.foreman.heartbeat.timeout_ms = 2_000;
    let err = config.validate().unwrap_err();
    assert_eq!(
        err,
        ConfigError::HeartbeatTimeout {
            timeout_ms: 2_000,
            interval_ms: 2_000,
        }
    );
    assert!(err.to_string().contains("timeout_ms (2000)"));
}
