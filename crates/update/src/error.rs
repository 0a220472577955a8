//! Update Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// An update error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for update operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Too many update jobs are pending; try again later.
    #[display("already updating")]
    QueueFull,
    /// Nothing is mounted where the path points; give up.
    #[display("no storage mounted for {_0:?}")]
    NoStorage(#[error(not(source))] String),
    /// The database at the path can't be updated from here; give up.
    #[display("database at {_0:?} does not support updating")]
    UnsupportedDatabase(#[error(not(source))] String),
    /// The worker thread couldn't be started.
    #[display("failed to start update thread")]
    Thread,
    /// The music directory can't be watched for changes; updates must be
    /// requested by hand.
    #[display("failed to watch {_0:?} for changes")]
    Watch(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}
