//! Command-line interface definitions.
//!
//! Global options pick the config file and override individual settings;
//! subcommands run the service or inspect its store.
//!
//! ```bash
//! # Run the expiry sweeper until Ctrl+C
//! activebrain serve --sweep-interval 10m
//!
//! # One sweep against a specific database
//! activebrain --db /tmp/sessions.db sweep
//!
//! # Inspect and retire a session
//! activebrain sessions --json
//! activebrain expire 20261017-alice-00003
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Session token lifecycle and result flushing service.
///
/// Keeps login sessions and their submitted result rows in a transactional
/// store and writes each expired session's results to a CSV file.
#[derive(Debug, Parser)]
#[command(name = "activebrain")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Print errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Config file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Session database path
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Directory for flushed CSV files
    #[arg(long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Session lifetime (e.g. 3600, 90s, 15m, 24h, 1d)
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration)]
    pub token_expiry: Option<Duration>,

    /// Time between background sweeps (same format as --token-expiry)
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration)]
    pub sweep_interval: Option<Duration>,

    /// Expire a session after this many submitted tasks
    #[arg(long, global = true, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_tasks: Option<u32>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the background sweeper until interrupted
    Serve,
    /// Run one sweep now and report what it did
    Sweep(SweepArgs),
    /// List stored sessions
    Sessions(SessionsArgs),
    /// Log a session out and flush its results
    Expire(SessionArg),
    /// Print a session's accumulated results as CSV
    Results(SessionArg),
}

/// Arguments for the sweep subcommand.
#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Print the sweep report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the sessions subcommand.
#[derive(Debug, Args)]
pub struct SessionsArgs {
    /// Print sessions as JSON
    #[arg(long)]
    pub json: bool,
}

/// A single session id argument.
#[derive(Debug, Args)]
pub struct SessionArg {
    /// Session id, e.g. 20261017-alice-00003
    #[arg(value_name = "ID")]
    pub id: String,
}

/// Parse a human-readable duration.
///
/// A bare number is seconds. Suffixes `s`, `m`, `h`, and `d` are accepted,
/// case-insensitive.
///
/// # Examples
///
/// ```
/// use activebrain::cli::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
/// assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
/// ```
///
/// # Errors
///
/// Returns an error if the string is empty, has no number, has an unknown
/// suffix, is zero, or overflows.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], s[idx..].trim().to_ascii_lowercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number: '{num_str}'"))?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return Err(format!("Unknown duration suffix: '{suffix}'")),
    };

    let secs = num
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Duration too large: '{s}'"))?;
    if secs == 0 {
        return Err("Duration must be greater than zero".to_string());
    }
    Ok(Duration::from_secs(secs))
}
