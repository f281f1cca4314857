//! Registry error types.

use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No cluster with this ID exists.
    #[error("cluster not found: {0}")]
    NotFound(String),

    /// A cluster with this ID already exists.
    #[error("cluster already exists: {0}")]
    Conflict(String),

    /// The registry handle has been closed.
    #[error("registry is closed")]
    Closed,

    /// A stored record could not be decoded.
    #[error("invalid record: {0}")]
    Invalid(String),
}

impl RegistryError {
    /// Returns true if this error means the cluster does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}
