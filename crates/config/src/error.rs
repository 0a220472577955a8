//! Config Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A source couldn't be read or didn't match the expected shape; fix the
    /// file or environment.
    #[display("failed to load configuration")]
    Figment,
    /// Loaded values are out of range; fix the value.
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}
