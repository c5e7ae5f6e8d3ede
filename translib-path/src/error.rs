//! Error types for the translib-path crate.

/// Errors produced while parsing a structured path string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// An element name was empty (e.g. `/a//b`)
    #[error("empty element name at offset {offset} in \"{path}\"")]
    EmptyElement { path: String, offset: usize },

    /// A key predicate was not closed with `]`
    #[error("unterminated key in \"{0}\"")]
    UnterminatedKey(String),

    /// A key predicate had no `=` or an empty key name
    #[error("malformed key predicate in \"{0}\"")]
    MalformedKey(String),

    /// Garbage after a key predicate
    #[error("unexpected character '{ch}' in \"{path}\"")]
    UnexpectedChar { path: String, ch: char },
}

/// Result type alias for path operations
pub type Result<T> = std::result::Result<T, PathError>;
