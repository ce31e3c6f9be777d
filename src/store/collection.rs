//! Logical collections held by the session database.

use std::fmt;

/// One of the two keyed collections in [`super::SessionDb`].
///
/// Both collections are keyed by the same session id: a result batch always
/// lives under the key of the session that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Session records.
    Sessions,
    /// Accumulated result batches.
    Results,
}

impl Collection {
    /// Backing table name.
    #[must_use]
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Results => "results",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}
