//! SQLite-backed session and results database.
//!
//! All access goes through a single connection guarded by a mutex, so every
//! transaction (reads included) is serialized with respect to every other.
//! Write transactions are opened `IMMEDIATE` so the database write lock is
//! taken up front rather than on first write.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;

use super::collection::Collection;

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        key   TEXT PRIMARY KEY NOT NULL,
        value BLOB NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS results (
        key   TEXT PRIMARY KEY NOT NULL,
        value BLOB NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS sequences (
        scope TEXT PRIMARY KEY NOT NULL,
        last  INTEGER NOT NULL
    ) WITHOUT ROWID;
";

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure (open, query, or commit).
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("failed to create database directory {path}: {source}")]
    Io {
        /// Directory being created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// An insert found the key already taken.
    #[error("{collection} record {key} already exists")]
    KeyExists {
        /// Collection holding the record.
        collection: Collection,
        /// Conflicting key.
        key: String,
    },

    /// The connection mutex was poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    Poisoned,

    /// A stored sequence counter does not fit the sequence type.
    #[error("sequence counter for `{scope}` out of range: {value}")]
    CounterOutOfRange {
        /// Scope key of the counter.
        scope: String,
        /// Raw stored value.
        value: i64,
    },
}

impl StoreError {
    /// Whether the failure came from another writer holding the database
    /// past the busy timeout.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Transactional key-value store with a `sessions` and a `results` collection.
pub struct SessionDb {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SessionDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDb").finish_non_exhaustive()
    }
}

impl SessionDb {
    /// Opens or creates a database file at `path`.
    ///
    /// Parent directories are created if needed. Fails if the file exists
    /// but is not a SQLite database.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Opened session database {} (journal={})", path.display(), mode);
        Self::init(conn)
    }

    /// Opens a private in-memory database. Contents vanish on drop.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` inside a write transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise.
    /// Only one transaction runs at a time across the whole database.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let txn = Txn { tx };
        let value = f(&txn)?;
        txn.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Runs `f` inside a read transaction. Writes made by `f` are discarded.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)?;
        let txn = Txn { tx };
        // Dropping the transaction rolls it back.
        f(&txn)
    }

    /// Closes the underlying connection, reporting any close failure.
    pub fn close(self) -> StoreResult<()> {
        let conn = self.conn.into_inner().map_err(|_| StoreError::Poisoned)?;
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

/// An open transaction over both collections.
pub struct Txn<'conn> {
    tx: Transaction<'conn>,
}

impl Txn<'_> {
    /// Reads the raw value stored under `key`.
    pub fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", collection.table());
        let value = self
            .tx
            .query_row(&sql, params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn put(&self, collection: Collection, key: &str, value: &[u8]) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            collection.table()
        );
        self.tx.execute(&sql, params![key, value])?;
        Ok(())
    }

    /// Stores `value` under a new `key`.
    ///
    /// # Errors
    ///
    /// `KeyExists` if the key is already present; the stored value is left
    /// untouched.
    pub fn insert(&self, collection: Collection, key: &str, value: &[u8]) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO NOTHING",
            collection.table()
        );
        if self.tx.execute(&sql, params![key, value])? == 0 {
            return Err(StoreError::KeyExists {
                collection,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Deletes `key`, returning whether a row was removed.
    pub fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", collection.table());
        let removed = self.tx.execute(&sql, params![key])?;
        Ok(removed > 0)
    }

    /// All keys in the collection, in ascending byte order.
    pub fn keys(&self, collection: Collection) -> StoreResult<Vec<String>> {
        let sql = format!("SELECT key FROM {} ORDER BY key", collection.table());
        let mut stmt = self.tx.prepare(&sql)?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Keys starting with `prefix`, in ascending byte order.
    pub fn keys_with_prefix(&self, collection: Collection, prefix: &str) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT key FROM {} WHERE substr(key, 1, ?2) = ?1 ORDER BY key",
            collection.table()
        );
        let len = i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX);
        let mut stmt = self.tx.prepare(&sql)?;
        let keys = stmt
            .query_map(params![prefix, len], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Number of entries in the collection.
    pub fn count(&self, collection: Collection) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
        let count: i64 = self.tx.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Highest sequence number ever recorded for `scope`, or 0.
    pub fn sequence_high_water(&self, scope: &str) -> StoreResult<u32> {
        let value: Option<i64> = self
            .tx
            .query_row(
                "SELECT last FROM sequences WHERE scope = ?1",
                params![scope],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(0),
            Some(v) => u32::try_from(v).map_err(|_| StoreError::CounterOutOfRange {
                scope: scope.to_string(),
                value: v,
            }),
        }
    }

    /// Records `last` as the high-water mark for `scope`.
    pub fn set_sequence_high_water(&self, scope: &str, last: u32) -> StoreResult<()> {
        self.tx.execute(
            "INSERT INTO sequences (scope, last) VALUES (?1, ?2)
             ON CONFLICT(scope) DO UPDATE SET last = MAX(last, excluded.last)",
            params![scope, i64::from(last)],
        )?;
        Ok(())
    }
}
