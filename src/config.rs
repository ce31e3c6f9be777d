//! Service configuration.
//!
//! Settings are layered, later layers winning:
//!
//! 1. Built-in defaults
//! 2. TOML file (`--config`, or the platform config directory)
//! 3. `ACTIVEBRAIN_*` environment variables
//! 4. CLI flags, applied with [`Config::merge_cli`]
//!
//! ```toml
//! database_path = "/var/lib/activebrain/sessions.db"
//! output_dir = "/var/lib/activebrain/results"
//! token_expiry_secs = 86400
//! sweep_interval_secs = 600
//! sequence_scope = "daily"
//! max_tasks_per_session = 12
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;
use crate::session::SequenceScope;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ACTIVEBRAIN_";

/// Default session lifetime: one day.
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 86_400;

const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "sessions.db";
const OUTPUT_DIR_NAME: &str = "results";

/// Keys understood in the config file.
const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "output_dir",
    "token_expiry_secs",
    "sweep_interval_secs",
    "sequence_scope",
    "max_tasks_per_session",
];

/// Minimum Jaro-Winkler similarity for a "did you mean" hint.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer could not be read or had a value of the wrong type.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// The config file exists but could not be parsed as TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },

    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Effective service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database holding sessions and result batches.
    pub database_path: PathBuf,
    /// Directory receiving flushed CSV files.
    pub output_dir: PathBuf,
    /// Session lifetime in seconds.
    pub token_expiry_secs: u64,
    /// Seconds between background sweeps. Defaults to the session lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
    /// Whether sequence numbers restart every day or run per user.
    pub sequence_scope: SequenceScope,
    /// Expire a session after this many submitted tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tasks_per_session: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join(DATABASE_FILE_NAME),
            output_dir: data_dir.join(OUTPUT_DIR_NAME),
            token_expiry_secs: DEFAULT_TOKEN_EXPIRY_SECS,
            sweep_interval_secs: None,
            sequence_scope: SequenceScope::default(),
            max_tasks_per_session: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "activebrain", "activebrain")
}

impl Config {
    /// Platform-specific default config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Loads defaults, the file at `path` if given (else the default
    /// location), and the environment, then validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load_from_path(&path),
            None => {
                log::debug!("No config directory on this platform, using defaults");
                Self::from_figment(Self::base_figment())
            }
        }
    }

    /// Loads configuration using `path` as the TOML layer.
    ///
    /// A missing file is not an error. Unknown keys are logged with a
    /// suggestion and otherwise ignored.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let mut figment = Self::base_figment();
        if path.exists() {
            warn_unknown_keys(path)?;
            figment = figment.merge(Toml::file(path));
            log::debug!("Loaded config file {}", path.display());
        } else {
            log::debug!("Config file {} not found, using defaults", path.display());
        }
        Self::from_figment(figment)
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies CLI overrides and re-validates.
    pub fn merge_cli(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(path) = &cli.db {
            self.database_path.clone_from(path);
        }
        if let Some(dir) = &cli.output_dir {
            self.output_dir.clone_from(dir);
        }
        if let Some(ttl) = cli.token_expiry {
            self.token_expiry_secs = ttl.as_secs();
        }
        if let Some(interval) = cli.sweep_interval {
            self.sweep_interval_secs = Some(interval.as_secs());
        }
        if let Some(max) = cli.max_tasks {
            self.max_tasks_per_session = Some(max);
        }
        self.validate()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_expiry_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "token_expiry_secs",
                reason: "must be greater than zero",
            });
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_secs",
                reason: "must be greater than zero",
            });
        }
        if self.max_tasks_per_session == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_tasks_per_session",
                reason: "must be greater than zero when set",
            });
        }
        Ok(())
    }

    /// Session lifetime.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_expiry_secs)
    }

    /// Time between background sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(self.token_expiry_secs))
    }
}

/// Closest known config key to `key`, if any is similar enough.
#[must_use]
pub fn suggest_key(key: &str) -> Option<&'static str> {
    KNOWN_KEYS
        .iter()
        .map(|known| (*known, strsim::jaro_winkler(key, known)))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(known, _)| known)
}

fn warn_unknown_keys(path: &Path) -> Result<(), ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for key in table.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())) {
        match suggest_key(key) {
            Some(hint) => log::warn!(
                "Unknown config key '{}' in {} (did you mean '{}'?)",
                key,
                path.display(),
                hint
            ),
            None => log::warn!("Unknown config key '{}' in {}", key, path.display()),
        }
    }
    Ok(())
}
