//! Session creation, lookup, and forced expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use crate::codec::{self, CodecError};
use crate::error::{SessionError, SessionResult};
use crate::session::data::{SequenceScope, Session, SessionId};
use crate::store::{Collection, SessionDb, StoreError, StoreResult, Txn};
use crate::sweeper::FlushSignal;

/// Source of sequence numbers carried over from an external quota service.
///
/// When present, a new session's sequence number is never lower than the
/// carried value plus one.
pub trait SequenceCarryOver: Send + Sync {
    /// Highest sequence number the quota service has seen for `user`.
    fn carried_sequence(&self, user: &str) -> Option<u32>;
}

/// A stored session as seen by a full listing.
#[derive(Debug)]
pub enum SessionEntry {
    /// A decodable record.
    Valid(Session),
    /// A record whose bytes failed to decode.
    Corrupt {
        /// Storage key.
        key: String,
        /// Decode failure.
        error: CodecError,
    },
}

/// Issues and tracks login sessions.
///
/// Cloning is cheap; clones share the same database.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<SessionDb>,
    ttl: chrono::Duration,
    scope: SequenceScope,
    carry_over: Option<Arc<dyn SequenceCarryOver>>,
    flush_signal: Option<FlushSignal>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .field("scope", &self.scope)
            .field("carry_over", &self.carry_over.as_ref().map(|_| "<carry-over>"))
            .field("flush_signal", &self.flush_signal)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Creates a store issuing sessions valid for `ttl`.
    #[must_use]
    pub fn new(db: Arc<SessionDb>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            db,
            ttl,
            scope: SequenceScope::default(),
            carry_over: None,
            flush_signal: None,
        }
    }

    /// Set how sequence numbers are scoped.
    #[must_use]
    pub fn with_scope(mut self, scope: SequenceScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the quota service consulted for carried-over sequence numbers.
    #[must_use]
    pub fn with_carry_over(mut self, carry_over: Arc<dyn SequenceCarryOver>) -> Self {
        self.carry_over = Some(carry_over);
        self
    }

    /// Set the signal raised when a session is expired early.
    #[must_use]
    pub fn with_flush_signal(mut self, signal: FlushSignal) -> Self {
        self.flush_signal = Some(signal);
        self
    }

    /// Creates a session for `user` and persists it.
    ///
    /// The sequence number is one above the highest of: any live session id
    /// sharing the scope, the persisted high-water mark, and the carried-over
    /// count. All of this happens in one write transaction, so concurrent
    /// creations for the same user never share a number.
    ///
    /// # Errors
    ///
    /// `Persistence` if the scope has used up every sequence number or the
    /// composed id is already taken. An existing record is never replaced.
    pub fn create(&self, user: &str) -> SessionResult<Session> {
        let carried = self
            .carry_over
            .as_ref()
            .and_then(|c| c.carried_sequence(user))
            .unwrap_or(0);

        let session = self.db.update(|txn| -> SessionResult<Session> {
            let now = Utc::now();
            let day = now.date_naive();
            let scope_key = self.scope.scope_key(day, user);

            let existing = self.highest_live_sequence(txn, day, user)?;
            let recorded = txn.sequence_high_water(&scope_key)?;
            let highest = existing.max(recorded).max(carried);
            let sequence = highest
                .checked_add(1)
                .ok_or_else(|| StoreError::CounterOutOfRange {
                    scope: scope_key.clone(),
                    value: i64::from(highest) + 1,
                })?;

            let session = Session {
                id: SessionId::compose(day, user, sequence),
                user: user.to_string(),
                expiration: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
                sequence_num: sequence,
                task_count: 0,
            };
            let bytes = codec::encode_session(&session).map_err(SessionError::Encode)?;
            txn.insert(Collection::Sessions, session.id.as_str(), &bytes)?;
            txn.set_sequence_high_water(&scope_key, sequence)?;
            Ok(session)
        })?;

        log::info!(
            "Created session {} for {} (sequence {})",
            session.id,
            session.user,
            session.sequence_num
        );
        Ok(session)
    }

    /// Looks up a valid session.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `Corrupt` if undecodable, `Expired` if its
    /// expiration has passed. None of these delete the record.
    pub fn get(&self, id: &SessionId) -> SessionResult<Session> {
        let session = self.db.view(|txn| read_session(txn, id))?;
        if session.is_expired() {
            log::debug!("Session {} is expired", id);
            return Err(SessionError::Expired(id.clone()));
        }
        Ok(session)
    }

    /// Expires `session` immediately (logout) and requests a flush.
    ///
    /// Returns the updated record. An already expired session keeps its
    /// original expiration.
    pub fn expire(&self, session: &Session) -> SessionResult<Session> {
        let expired = self.db.update(|txn| -> SessionResult<Session> {
            let mut current = read_session(txn, &session.id)?;
            let now = Utc::now();
            if current.expiration > now {
                current.expiration = now;
                write_session(txn, &current)?;
            }
            Ok(current)
        })?;

        log::info!("Expired session {} for {}", expired.id, expired.user);
        if let Some(signal) = &self.flush_signal {
            signal.request();
        }
        Ok(expired)
    }

    /// Lists every stored session in id order, including expired and
    /// corrupt records.
    pub fn scan(&self) -> SessionResult<Vec<SessionEntry>> {
        let entries = self.db.view(|txn| -> StoreResult<Vec<SessionEntry>> {
            let mut entries = Vec::new();
            for key in txn.keys(Collection::Sessions)? {
                let Some(bytes) = txn.get(Collection::Sessions, &key)? else {
                    continue;
                };
                entries.push(match codec::decode_session(&key, &bytes) {
                    Ok(session) => SessionEntry::Valid(session),
                    Err(error) => SessionEntry::Corrupt { key, error },
                });
            }
            Ok(entries)
        })?;
        Ok(entries)
    }

    fn highest_live_sequence(&self, txn: &Txn<'_>, day: NaiveDate, user: &str) -> StoreResult<u32> {
        let keys = match self.scope {
            SequenceScope::Daily => {
                txn.keys_with_prefix(Collection::Sessions, &SessionId::prefix(day, user))?
            }
            SequenceScope::PerUser => txn.keys(Collection::Sessions)?,
        };
        Ok(keys
            .into_iter()
            .map(SessionId::from)
            .filter_map(|id| match id.parts() {
                Some((_, owner, sequence)) if owner == user => Some(sequence),
                _ => None,
            })
            .max()
            .unwrap_or(0))
    }
}

/// Reads and decodes the session stored under `id`.
pub(crate) fn read_session(txn: &Txn<'_>, id: &SessionId) -> SessionResult<Session> {
    let bytes = txn
        .get(Collection::Sessions, id.as_str())?
        .ok_or_else(|| SessionError::NotFound(id.clone()))?;
    codec::decode_session(id.as_str(), &bytes).map_err(|e| {
        log::warn!("Session record {} is corrupt: {}", id, e);
        SessionError::corrupt(Collection::Sessions, id.as_str(), e)
    })
}

/// Encodes and stores `session` under its id.
pub(crate) fn write_session(txn: &Txn<'_>, session: &Session) -> SessionResult<()> {
    let bytes = codec::encode_session(session).map_err(SessionError::Encode)?;
    txn.put(Collection::Sessions, session.id.as_str(), &bytes)?;
    Ok(())
}
