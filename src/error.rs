// src/error.rs

//! Crate-wide error type
//!
//! Errors are grouped by the failure domain they originate from so callers
//! can distinguish fatal configuration problems from per-item failures that
//! only get accumulated into action results.

use thiserror::Error;

/// Errors produced by the repository management core
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid denotation, missing required field, unknown database
    #[error("configuration error: {0}")]
    Config(String),

    /// Creation/copy/rename/remove failures on the filesystem
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// Storage environment or transaction failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Subprocess spawn failure or non-zero exit
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Per-archive or per-file parse failure
    #[error("parse error: {0}")]
    Parse(String),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The action observed its abort flag at a safe point
    #[error("aborted")]
    Aborted,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Filesystem(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
