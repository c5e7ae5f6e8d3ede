//! Error types for the translib-subscribe crate.

use translib_db::DbError;
use translib_path::PathError;

/// Errors returned by app modules from their subscribe and get callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// Requested data does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Path or mode is not supported by the module
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Request was malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Module failed internally
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

/// Errors surfaced by the subscribe APIs.
///
/// Only failures detected before any watch is registered reach the caller.
/// Everything after registration is logged and absorbed.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// An app module rejected the path or could not map it
    #[error("translation failed for {path}: {source}")]
    Translation {
        path: String,
        #[source]
        source: AppError,
    },

    /// Path or mode cannot be subscribed
    #[error("{0}")]
    NotSupported(String),

    /// Low level watch registration failed; the request was rolled back
    #[error("watch registration failed: {0}")]
    Registration(#[source] DbError),

    /// An app module broke its contract
    #[error("internal error: {0}")]
    Internal(String),

    /// Request was malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration provided
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    App(#[from] AppError),
}

/// Result type alias for subscribe operations
pub type Result<T> = std::result::Result<T, SubscribeError>;
