//! CSV output for retired sessions.
//!
//! One file is written per flushed session. The header row is the batch's
//! column set in sorted order; each data row aligns its values to that
//! header, leaving a cell empty where the row lacks the column. Rows keep
//! their submission order.
//!
//! # File names
//!
//! `{expiration:%Y%m%dT%H%M%S}-{user}-{sequence:02}[-{task}].csv`, with the
//! user and task reduced to `[A-Za-z0-9._-]`. A user name that loses
//! characters in that reduction gets `.{hash}` appended (the first eight hex
//! digits of its SHA-256), so `张三` and `李四` land in different files.
//!
//! A flush never replaces an existing file. If the name is taken (the same
//! user's sequence restarted on a new day, say), `-2`, `-3`, ... is added
//! before the extension.
//!
//! # Example
//!
//! ```
//! use activebrain::output::csv::CsvOutput;
//! use activebrain::results::{ResultBatch, ResultRow};
//!
//! let mut batch = ResultBatch::new();
//! batch.append_rows(vec![
//!     ResultRow::new().with("x", 1).with("y", 2),
//!     ResultRow::new().with("x", 3),
//! ]);
//! let csv = CsvOutput::new(&batch).to_string().unwrap();
//! assert_eq!(csv, "x,y\n1,2\n3,\n");
//! ```

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::results::ResultBatch;
use crate::session::Session;

/// Timestamp layout used in output file names.
const FILE_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Suffix for files still being written.
const PARTIAL_SUFFIX: &str = "partial";

/// Errors that can occur while flushing a batch to CSV.
#[derive(Debug, Error)]
pub enum FlushError {
    /// I/O error during writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during CSV serialization.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// CSV formatter for one result batch.
pub struct CsvOutput<'a> {
    batch: &'a ResultBatch,
}

impl<'a> CsvOutput<'a> {
    /// Create a new CSV formatter.
    #[must_use]
    pub fn new(batch: &'a ResultBatch) -> Self {
        Self { batch }
    }

    /// Write the header and all rows to the given writer.
    ///
    /// # Errors
    ///
    /// Returns `FlushError` if writing or serialization fails.
    pub fn write_to<W: io::Write>(&self, writer: W) -> Result<(), FlushError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let header = self.batch.header();
        csv_writer.write_record(&header)?;

        let mut values = Vec::with_capacity(header.len());
        for row in &self.batch.rows {
            values.clear();
            values.extend(header.iter().map(|column| row.cell(column)));
            csv_writer.write_record(&values)?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Generate the CSV output as a string.
    ///
    /// # Errors
    ///
    /// Returns `FlushError` if serialization fails.
    pub fn to_string(&self) -> Result<String, FlushError> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitized user component, tagged with a short hash when sanitizing lost
/// information.
fn user_component(user: &str) -> String {
    let sanitized = sanitize(user);
    if sanitized == user {
        return sanitized;
    }
    let digest = Sha256::digest(user.as_bytes());
    let tag: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{sanitized}.{tag}")
}

fn file_stem(session: &Session, task: Option<&str>) -> String {
    let mut stem = format!(
        "{}-{}-{:02}",
        session.expiration.format(FILE_TIME_FORMAT),
        user_component(&session.user),
        session.sequence_num
    );
    if let Some(task) = task.filter(|t| !t.is_empty()) {
        stem.push('-');
        stem.push_str(&sanitize(task));
    }
    stem
}

/// Deterministic output file name for a retired session.
#[must_use]
pub fn file_name(session: &Session, task: Option<&str>) -> String {
    format!("{}.csv", file_stem(session, task))
}

/// First `{stem}.csv`, `{stem}-2.csv`, ... not yet present in `dir`.
fn free_name(dir: &Path, stem: &str) -> String {
    let mut name = format!("{stem}.csv");
    let mut n = 2u32;
    while dir.join(&name).exists() {
        name = format!("{stem}-{n}.csv");
        n += 1;
    }
    name
}

/// Writes `batch` for `session` into `dir`, returning the final path.
///
/// The file is written under a `.partial` name, synced, and then renamed, so
/// a failed flush never leaves a truncated CSV behind. An existing file is
/// never replaced; the name gets a numeric suffix instead.
///
/// The free-name check and the rename are not atomic. Callers serialize
/// flushes into one directory (the sweeper holds the database write lock).
pub fn write_file(dir: &Path, session: &Session, batch: &ResultBatch) -> Result<PathBuf, FlushError> {
    fs::create_dir_all(dir)?;
    let name = free_name(dir, &file_stem(session, batch.task.as_deref()));
    let final_path = dir.join(&name);
    let partial_path = dir.join(format!("{name}.{PARTIAL_SUFFIX}"));

    let written = (|| -> Result<(), FlushError> {
        let mut writer = BufWriter::new(File::create(&partial_path)?);
        CsvOutput::new(batch).write_to(&mut writer)?;
        let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
        fs::rename(&partial_path, &final_path)?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&partial_path);
        return Err(e);
    }
    Ok(final_path)
}
