//! Encoding of stored records.
//!
//! Every value written to the store is wrapped in an envelope carrying the
//! record kind, a format version, and a SHA-256 checksum of the payload text:
//!
//! ```text
//! {"kind":"session","version":1,"checksum":"<sha256 hex>","payload":"{...}"}
//! ```
//!
//! The checksum covers the payload exactly as stored, so decoding tolerates
//! unknown fields in both the envelope and the record, and missing record
//! fields fall back to their defaults.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::results::ResultBatch;
use crate::session::{Session, SessionId};

/// Current version of the record format.
pub const RECORD_VERSION: u32 = 1;

const SESSION_KIND: &str = "session";
const RESULTS_KIND: &str = "results";

/// Reasons a stored value could not be decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope itself is not valid JSON of the expected shape.
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The payload does not match its recorded checksum.
    #[error("integrity check failed: checksum mismatch")]
    ChecksumMismatch,

    /// The record was written by an unknown format version.
    #[error("unsupported record version {0} (current is {})", RECORD_VERSION)]
    UnsupportedVersion(u32),

    /// The envelope holds a different kind of record.
    #[error("expected a {expected} record, found {found}")]
    WrongKind {
        /// Kind the caller asked for.
        expected: &'static str,
        /// Kind found in the envelope.
        found: String,
    },

    /// The payload is not a valid record.
    #[error("malformed payload: {0}")]
    Payload(#[source] serde_json::Error),

    /// Encoding failed.
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    version: u32,
    checksum: String,
    payload: String,
}

fn checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn encode<T: Serialize>(kind: &str, record: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_string(record).map_err(CodecError::Encode)?;
    let envelope = Envelope {
        kind: kind.to_string(),
        version: RECORD_VERSION,
        checksum: checksum(&payload),
        payload,
    };
    serde_json::to_vec(&envelope).map_err(CodecError::Encode)
}

fn decode<T: DeserializeOwned>(expected: &'static str, bytes: &[u8]) -> Result<T, CodecError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(CodecError::Envelope)?;
    if envelope.version != RECORD_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.version));
    }
    if envelope.kind != expected {
        return Err(CodecError::WrongKind {
            expected,
            found: envelope.kind,
        });
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(CodecError::ChecksumMismatch);
    }
    serde_json::from_str(&envelope.payload).map_err(CodecError::Payload)
}

/// Encodes a session record.
pub fn encode_session(session: &Session) -> Result<Vec<u8>, CodecError> {
    encode(SESSION_KIND, session)
}

/// Decodes the session stored under `key`.
///
/// A record without an id takes the storage key as its id.
pub fn decode_session(key: &str, bytes: &[u8]) -> Result<Session, CodecError> {
    let mut session: Session = decode(SESSION_KIND, bytes)?;
    if session.id.is_empty() {
        session.id = SessionId::from(key);
    }
    Ok(session)
}

/// Encodes a result batch.
pub fn encode_results(batch: &ResultBatch) -> Result<Vec<u8>, CodecError> {
    encode(RESULTS_KIND, batch)
}

/// Decodes a result batch, restoring its column invariant.
pub fn decode_results(bytes: &[u8]) -> Result<ResultBatch, CodecError> {
    let mut batch: ResultBatch = decode(RESULTS_KIND, bytes)?;
    batch.repair_columns();
    Ok(batch)
}
