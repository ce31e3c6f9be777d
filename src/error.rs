//! Error taxonomy and exit codes.

use serde::Serialize;
use thiserror::Error;

use crate::codec::CodecError;
use crate::session::SessionId;
use crate::store::{Collection, StoreError};

/// Errors returned to callers of the session service.
///
/// `NotFound` and `Expired` are ordinary outcomes that send the caller back
/// to the login page. `Corrupt` means the stored record is unusable; the
/// sweeper removes it. `Persistence` fails the current request only.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No record exists for this id.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// The record exists but its expiration has passed.
    #[error("session {0} has expired")]
    Expired(SessionId),

    /// The stored record could not be decoded.
    #[error("corrupt {collection} record {key}: {source}")]
    Corrupt {
        /// Collection holding the record.
        collection: Collection,
        /// Storage key of the record.
        key: String,
        /// Decode failure.
        #[source]
        source: CodecError,
    },

    /// The credentials were rejected.
    #[error("authentication failed for user {0}")]
    Unauthorized(String),

    /// The transaction layer failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// A record could not be encoded for storage.
    #[error(transparent)]
    Encode(CodecError),
}

impl SessionError {
    /// Whether the caller should send the user back to re-authenticate.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Expired(_) | Self::Corrupt { .. } | Self::Unauthorized(_)
        )
    }

    /// Whether the caller may resubmit the same request.
    ///
    /// Only a database held busy by another writer qualifies. Nothing is
    /// retried automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(e) if e.is_busy())
    }

    pub(crate) fn corrupt(collection: Collection, key: &str, source: CodecError) -> Self {
        Self::Corrupt {
            collection,
            key: key.to_string(),
            source,
        }
    }
}

/// Result alias for session service operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Exit codes for the activebrain binary.
///
/// - 0: Success
/// - 1: General error (unexpected failure)
/// - 2: Nothing to do (e.g. no such session, empty sweep)
/// - 3: Partial success (sweep finished but some flushes failed)
/// - 130: Interrupted by user (Ctrl+C)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Completed normally.
    Success = 0,
    /// An unexpected error occurred.
    GeneralError = 1,
    /// Completed, but there was nothing to act on.
    NothingToDo = 2,
    /// Completed with some non-fatal failures.
    PartialSuccess = 3,
    /// Interrupted by Ctrl+C.
    Interrupted = 130,
}

impl ExitCode {
    /// Get the numeric exit code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Get the machine-readable code prefix.
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Success => "AB000",
            Self::GeneralError => "AB001",
            Self::NothingToDo => "AB002",
            Self::PartialSuccess => "AB003",
            Self::Interrupted => "AB130",
        }
    }
}

/// Structured error information for JSON output.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    /// The error code (e.g., "AB001")
    pub code: String,
    /// The exit code number
    pub exit_code: i32,
    /// Human-readable error message
    pub message: String,
    /// Whether the operation was interrupted
    pub interrupted: bool,
}

impl StructuredError {
    /// Create a new structured error from an anyhow error and an exit code.
    #[must_use]
    pub fn new(err: &anyhow::Error, exit_code: ExitCode) -> Self {
        Self {
            code: exit_code.code_prefix().to_string(),
            exit_code: exit_code.as_i32(),
            message: format!("{err:#}"),
            interrupted: exit_code == ExitCode::Interrupted,
        }
    }
}
