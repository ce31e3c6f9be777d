//! Persistent storage for sessions and their result batches.
//!
//! # Architecture
//!
//! * [`database`]: SQLite-backed transactional key-value layer.
//! * [`collection`]: The two logical collections (`sessions`, `results`).
//!
//! # Transactions
//!
//! Every read and write goes through [`SessionDb::update`] or
//! [`SessionDb::view`], which hand the caller a [`Txn`] spanning both
//! collections. A session and its result batch can therefore be created,
//! flushed, or deleted together atomically.
//!
//! A third internal table keeps per-scope sequence high-water marks so that
//! sequence numbers never repeat after old sessions are swept away.

pub mod collection;
pub mod database;

pub use collection::Collection;
pub use database::{SessionDb, StoreError, StoreResult, Txn};
