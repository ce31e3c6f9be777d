use activebrain::cli::Cli;
use activebrain::config::{Config, ConfigError, DEFAULT_TOKEN_EXPIRY_SECS};
use activebrain::session::SequenceScope;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::tempdir;

static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Clear all ACTIVEBRAIN_* environment variables to avoid interference.
fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("ACTIVEBRAIN_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
fn test_missing_file_uses_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();

    let config = Config::load_from_path(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.token_expiry_secs, DEFAULT_TOKEN_EXPIRY_SECS);
    assert_eq!(config.sweep_interval(), Duration::from_secs(DEFAULT_TOKEN_EXPIRY_SECS));
    assert_eq!(config.sequence_scope, SequenceScope::Daily);
    assert_eq!(config.max_tasks_per_session, None);
}

#[test]
fn test_load_from_toml() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
database_path = "/srv/ab/sessions.db"
output_dir = "/srv/ab/out"
token_expiry_secs = 1800
sweep_interval_secs = 60
sequence_scope = "per_user"
max_tasks_per_session = 10
"#,
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.database_path, PathBuf::from("/srv/ab/sessions.db"));
    assert_eq!(config.output_dir, PathBuf::from("/srv/ab/out"));
    assert_eq!(config.token_ttl(), Duration::from_secs(1800));
    assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    assert_eq!(config.sequence_scope, SequenceScope::PerUser);
    assert_eq!(config.max_tasks_per_session, Some(10));
}

#[test]
fn test_hierarchy_file_env_cli() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "token_expiry_secs = 1800\nsweep_interval_secs = 60\n").unwrap();

    std::env::set_var("ACTIVEBRAIN_TOKEN_EXPIRY_SECS", "900");
    let mut config = Config::load_from_path(&path).unwrap();
    std::env::remove_var("ACTIVEBRAIN_TOKEN_EXPIRY_SECS");
    assert_eq!(config.token_expiry_secs, 900);
    assert_eq!(config.sweep_interval_secs, Some(60));

    let cli = Cli::try_parse_from([
        "activebrain",
        "--token-expiry",
        "2h",
        "--output-dir",
        "/tmp/flushed",
        "sweep",
    ])
    .unwrap();
    config.merge_cli(&cli).unwrap();
    assert_eq!(config.token_expiry_secs, 7200);
    assert_eq!(config.sweep_interval_secs, Some(60));
    assert_eq!(config.output_dir, PathBuf::from("/tmp/flushed"));
}

#[test]
fn test_unknown_key_is_ignored() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    // 'token_expiry' is a typo for 'token_expiry_secs'
    fs::write(&path, "token_expiry = 5\n").unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.token_expiry_secs, DEFAULT_TOKEN_EXPIRY_SECS);
}

#[test]
fn test_wrong_type_is_an_error() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "token_expiry_secs = \"a day\"\n").unwrap();

    assert!(matches!(
        Config::load_from_path(&path),
        Err(ConfigError::Load(_))
    ));
}

#[test]
fn test_malformed_toml_is_an_error() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "token_expiry_secs = = 3\n").unwrap();

    assert!(matches!(
        Config::load_from_path(&path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn test_zero_expiry_is_rejected() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "token_expiry_secs = 0\n").unwrap();

    let err = Config::load_from_path(&path).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "token_expiry_secs",
            ..
        }
    ));
    assert!(err.to_string().contains("token_expiry_secs"));
}
