//! ActiveBrain session service.
//!
//! Issues login sessions for the data-collection portal, accumulates the
//! result rows each session submits, and when a session expires or logs
//! out, writes its results to a CSV file and removes it from the store.
//!
//! # Modules
//!
//! * [`store`]: SQLite-backed transactional key-value layer.
//! * [`codec`]: Checksummed, versioned record encoding.
//! * [`session`]: Session records, ids, and the [`session::SessionStore`].
//! * [`results`]: Result rows, batches, and the [`results::ResultAccumulator`].
//! * [`sweeper`]: The background [`sweeper::ExpirySweeper`] and flush signal.
//! * [`output`]: CSV rendering and atomic output files.
//! * [`service`]: [`service::SessionService`], tying the above together.

pub mod auth;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod results;
pub mod service;
pub mod session;
pub mod signal;
pub mod store;
pub mod sweeper;

use std::io::{self, Write};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use yansi::Paint;

use crate::cli::{Cli, Commands, SessionsArgs, SweepArgs};
use crate::config::Config;
use crate::error::{ExitCode, SessionError};
use crate::output::CsvOutput;
use crate::service::SessionService;
use crate::session::{SessionEntry, SessionId};
use crate::sweeper::SweepReport;

/// How often `serve` checks for a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Runs the command selected on the command line.
pub fn run_app(cli: Cli) -> anyhow::Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);
    if cli.no_color {
        yansi::disable();
    }

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .merge_cli(&cli)
        .context("Invalid command-line override")?;
    log::debug!("Effective configuration: {:?}", config);

    let service = SessionService::open(&config).with_context(|| {
        format!(
            "Failed to open session database {}",
            config.database_path.display()
        )
    })?;

    let code = match &cli.command {
        Commands::Serve => serve(service, &config)?,
        Commands::Sweep(args) => {
            let code = sweep(&service, args)?;
            service.close()?;
            code
        }
        Commands::Sessions(args) => {
            let code = list_sessions(&service, args)?;
            service.close()?;
            code
        }
        Commands::Expire(arg) => {
            let code = expire(&service, SessionId::from(arg.id.as_str()))?;
            service.close()?;
            code
        }
        Commands::Results(arg) => {
            let code = print_results(&service, SessionId::from(arg.id.as_str()))?;
            service.close()?;
            code
        }
    };
    Ok(code)
}

fn serve(mut service: SessionService, config: &Config) -> anyhow::Result<ExitCode> {
    let shutdown = signal::install_handler()?;
    service
        .start_sweeper(shutdown.clone())
        .context("Failed to start expiry sweeper")?;
    log::info!(
        "Serving sessions from {} (ttl {:?}, sweep every {:?}, output {})",
        config.database_path.display(),
        config.token_ttl(),
        config.sweep_interval(),
        config.output_dir.display()
    );

    shutdown.wait(SHUTDOWN_POLL);
    service.close().context("Failed to close session service")?;
    Ok(ExitCode::Interrupted)
}

fn sweep(service: &SessionService, args: &SweepArgs) -> anyhow::Result<ExitCode> {
    let report = service.sweep_now().context("Sweep failed")?;
    print_report(&report, args.json)?;
    Ok(report_exit_code(&report))
}

fn report_exit_code(report: &SweepReport) -> ExitCode {
    if report.failed > 0 {
        ExitCode::PartialSuccess
    } else if report.scanned == 0 {
        ExitCode::NothingToDo
    } else {
        ExitCode::Success
    }
}

fn print_report(report: &SweepReport, json: bool) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, report)?;
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "{}", report)?;
    }
    Ok(())
}

/// One line of `sessions` output.
#[derive(Debug, Serialize)]
struct SessionListing {
    id: String,
    user: Option<String>,
    sequence_num: Option<u32>,
    task_count: Option<u32>,
    expiration: Option<DateTime<Utc>>,
    remaining_secs: Option<i64>,
    status: &'static str,
}

impl SessionListing {
    fn from_entry(entry: SessionEntry, now: DateTime<Utc>) -> Self {
        match entry {
            SessionEntry::Valid(session) => Self {
                remaining_secs: session.remaining_at(now).map(|d| d.num_seconds()),
                status: if session.is_expired_at(now) {
                    "expired"
                } else {
                    "live"
                },
                id: session.id.to_string(),
                user: Some(session.user),
                sequence_num: Some(session.sequence_num),
                task_count: Some(session.task_count),
                expiration: Some(session.expiration),
            },
            SessionEntry::Corrupt { key, error } => {
                log::debug!("Listing corrupt session {}: {}", key, error);
                Self {
                    id: key,
                    user: None,
                    sequence_num: None,
                    task_count: None,
                    expiration: None,
                    remaining_secs: None,
                    status: "corrupt",
                }
            }
        }
    }
}

fn list_sessions(service: &SessionService, args: &SessionsArgs) -> anyhow::Result<ExitCode> {
    let now = Utc::now();
    let listings: Vec<SessionListing> = service
        .list_sessions()?
        .into_iter()
        .map(|entry| SessionListing::from_entry(entry, now))
        .collect();

    let mut stdout = io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &listings)?;
        writeln!(stdout)?;
    } else {
        for listing in &listings {
            let status = match listing.status {
                "live" => listing.status.green(),
                "expired" => listing.status.yellow(),
                _ => listing.status.red(),
            };
            let expiration = listing
                .expiration
                .map(|e| e.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            let remaining = listing
                .remaining_secs
                .map(format_remaining)
                .unwrap_or_default();
            writeln!(
                stdout,
                "{:<32} {:<8} tasks={:<4} {} {}",
                listing.id.as_str().bold(),
                status,
                listing.task_count.unwrap_or(0),
                expiration,
                remaining.dim()
            )?;
        }
    }

    Ok(if listings.is_empty() {
        ExitCode::NothingToDo
    } else {
        ExitCode::Success
    })
}

/// Renders a remaining lifetime as `(1h05m left)`.
fn format_remaining(secs: i64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("({hours}h{minutes:02}m left)")
    } else if minutes > 0 {
        format!("({minutes}m{seconds:02}s left)")
    } else {
        format!("({seconds}s left)")
    }
}

fn expire(service: &SessionService, id: SessionId) -> anyhow::Result<ExitCode> {
    match service.get_session(&id) {
        Ok(session) => {
            service.expire_session(&session)?;
        }
        Err(SessionError::Expired(_)) => log::info!("Session {} had already expired", id),
        Err(SessionError::NotFound(_)) => {
            eprintln!("No session {}", id);
            return Ok(ExitCode::NothingToDo);
        }
        Err(e) => return Err(e.into()),
    }

    let report = service.sweep_now().context("Flush after logout failed")?;
    print_report(&report, false)?;
    Ok(report_exit_code(&report))
}

fn print_results(service: &SessionService, id: SessionId) -> anyhow::Result<ExitCode> {
    let batch = match service.get_results(&id) {
        Ok(batch) => batch,
        Err(SessionError::NotFound(_)) => {
            eprintln!("No results for session {}", id);
            return Ok(ExitCode::NothingToDo);
        }
        Err(e) => return Err(e.into()),
    };
    CsvOutput::new(&batch).write_to(io::stdout().lock())?;
    Ok(ExitCode::Success)
}
