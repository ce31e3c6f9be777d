//! Data structures for login sessions.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Date format used for the id prefix.
const DAY_FORMAT: &str = "%Y%m%d";

/// Opaque session identifier, carried externally as a cookie value.
///
/// Internally the id is `{YYYYMMDD}-{user}-{sequence:05}`, so every session a
/// user opens on a given day shares a lexicographic prefix. The day prefix
/// has a fixed width and the sequence follows the last `-`, which keeps the
/// layout unambiguous for any username.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Builds the id for `user`'s `sequence`-th session on `day`.
    #[must_use]
    pub fn compose(day: NaiveDate, user: &str, sequence: u32) -> Self {
        Self(format!("{}{:05}", Self::prefix(day, user), sequence))
    }

    /// Prefix shared by all of `user`'s sessions on `day`.
    #[must_use]
    pub fn prefix(day: NaiveDate, user: &str) -> String {
        format!("{}-{}-", day.format(DAY_FORMAT), user)
    }

    /// Splits the id into its day, user, and sequence parts.
    ///
    /// Returns `None` for ids not produced by [`SessionId::compose`].
    #[must_use]
    pub fn parts(&self) -> Option<(NaiveDate, &str, u32)> {
        let (day, rest) = self.0.split_once('-')?;
        let (user, sequence) = rest.rsplit_once('-')?;
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let day = NaiveDate::parse_from_str(day, DAY_FORMAT).ok()?;
        let sequence = sequence.parse().ok()?;
        Some((day, user, sequence))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (only possible for records missing their id).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How sequence numbers are scoped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceScope {
    /// Numbering restarts for each (user, day).
    #[default]
    Daily,
    /// Numbering is continuous per user across days.
    PerUser,
}

impl SequenceScope {
    /// Key under which the sequence high-water mark is tracked.
    #[must_use]
    pub fn scope_key(self, day: NaiveDate, user: &str) -> String {
        match self {
            Self::Daily => format!("{}/{}", day.format(DAY_FORMAT), user),
            Self::PerUser => user.to_string(),
        }
    }
}

impl fmt::Display for SequenceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::PerUser => write!(f, "per_user"),
        }
    }
}

/// A login session.
///
/// Missing fields decode to their defaults, so older records stay readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    /// Unique id, also the storage key.
    pub id: SessionId,
    /// Authenticated user name.
    pub user: String,
    /// Instant after which the session is no longer valid.
    pub expiration: DateTime<Utc>,
    /// Per-user ordinal, also embedded in the id.
    pub sequence_num: u32,
    /// Result batches submitted so far.
    pub task_count: u32,
}

impl Session {
    /// Whether the session has expired as of `now`.
    ///
    /// A session is valid only while its expiration lies strictly in the future.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Whether the session has expired as of the current time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry, or `None` if already expired.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        (!self.is_expired_at(now)).then(|| self.expiration - now)
    }
}
