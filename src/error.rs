// src/error.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

/// Errors surfaced by capstan operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A repository or package name resolved to nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// No registered driver recognizes the repository identifier.
    #[error("no driver for {0}")]
    NoDriver(String),

    /// A fetched index could not be deserialized into the expected shape.
    #[error("unreadable index for {identifier}: {message}")]
    UnreadableIndex { identifier: String, message: String },

    /// Downloaded bytes hash to a value different from the manifest digest.
    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Local file open/read/write/delete/move failed.
    #[error("io error: {0}")]
    Io(String),

    /// Precondition failure on add.
    #[error("already present: {0}")]
    AlreadyPresent(String),

    /// Precondition failure on remove.
    #[error("not present: {0}")]
    NotPresent(String),

    /// A remote fetch failed below the index layer.
    #[error("cannot fetch {identifier}: {message}")]
    Fetch { identifier: String, message: String },

    /// One or more transaction actions raised.
    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Io(format!("serialization: {e}"))
    }
}

/// Result type for capstan operations.
pub type Result<T> = std::result::Result<T, Error>;
