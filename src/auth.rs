//! Credential checking seam.
//!
//! The portal's credential store lives outside this crate. It plugs in
//! through [`Authenticator`]; the session service only asks whether a
//! username/password pair is acceptable.

use std::collections::HashMap;

/// Checks login credentials.
pub trait Authenticator: Send + Sync {
    /// Returns whether `password` is correct for `username`.
    fn challenge(&self, username: &str, password: &str) -> bool;
}

/// Fixed in-memory account table.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    accounts: HashMap<String, String>,
}

impl StaticAuthenticator {
    /// Builds the table from `(username, password)` pairs.
    pub fn new<I, U, P>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            accounts: accounts
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    /// Number of known accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no accounts are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Authenticator for StaticAuthenticator {
    fn challenge(&self, username: &str, password: &str) -> bool {
        self.accounts
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}
