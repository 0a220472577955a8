//! Database Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A database error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Reading or writing the database file failed.
    #[display("database file I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// The database file exists but couldn't be understood.
    #[display("invalid database file: {_0}")]
    Serialization(#[error(not(source))] String),
    /// The database file does not exist.
    #[display("database file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
