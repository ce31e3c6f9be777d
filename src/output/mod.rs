//! Output formatters for flushed result batches.
//!
//! - CSV files, one per retired session (see [`csv`]).

pub mod csv;

// Re-export main types
pub use self::csv::{file_name, write_file, CsvOutput, FlushError};
