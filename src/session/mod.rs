//! Login sessions.
//!
//! A session is created when a user authenticates and identifies every later
//! request through an opaque cookie value. It stays valid until its
//! expiration passes or the user logs out.
//!
//! # Architecture
//!
//! * [`data`]: The [`Session`] record, its [`SessionId`], and [`SequenceScope`].
//! * [`store`]: [`SessionStore`], which creates, looks up, and expires sessions.
//!
//! # Sequence numbers
//!
//! Each session carries a per-user ordinal that is also embedded in its id.
//! Allocation happens inside a single write transaction and is checked against
//! a persisted high-water mark, so numbers stay unique under concurrent logins
//! and never repeat after old sessions are swept away.

pub mod data;
pub mod store;

pub use data::{SequenceScope, Session, SessionId};
pub use store::{SequenceCarryOver, SessionEntry, SessionStore};
