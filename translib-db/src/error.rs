//! Error types for the translib-db crate.

use crate::key::{DbNum, Key};

/// Errors returned by store connections and watches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// Entry does not exist
    #[error("entry not found: {table}|{key}")]
    NotFound { table: String, key: Key },

    /// Connection was closed before the call
    #[error("connection closed")]
    ConnectionClosed,

    /// On-change cache operation on a connection opened without on-change support
    #[error("on-change caching is not enabled on this connection")]
    OnChangeDisabled,

    /// Write attempted through a read-only connection
    #[error("write disabled on {0} connection")]
    WriteDisabled(DbNum),

    /// Keyspace subscription could not be established
    #[error("subscribe failed on {db}: {reason}")]
    SubscribeFailed { db: DbNum, reason: String },

    /// Scan cursor misuse
    #[error("invalid scan: {0}")]
    InvalidScan(String),
}

impl DbError {
    /// Whether this error means the entry does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, DbError>;
