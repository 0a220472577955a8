//! DST Error Types
//!
//! Every error here is scoped to a single frame. Callers either substitute
//! silence for the frame ([`ParallelDecoder`](crate::ParallelDecoder)) or
//! abort the stream.

use derive_more::{Display, Error};

/// A DST decoding error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for DST operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ran out of frame data while reading a header field.
    #[display("unexpected end of frame")]
    Eof,
    /// The stuffing bits of an uncoded frame were not zero.
    #[display("illegal stuffing pattern in uncoded frame")]
    IllegalStuffing,
    /// Segment resolution, length or count out of bounds.
    #[display("invalid segmentation: {_0}")]
    Segmentation(#[error(not(source))] String),
    /// Channel to table mapping referenced an unassigned table.
    #[display("invalid table mapping: {_0}")]
    Mapping(#[error(not(source))] String),
    /// Prediction filter coefficients could not be decoded.
    #[display("invalid filter coefficients: {_0}")]
    Coefficient(#[error(not(source))] String),
    /// Probability table entries could not be decoded.
    #[display("invalid probability table: {_0}")]
    ProbabilityTable(#[error(not(source))] String),
    /// Arithmetic coded payload is malformed.
    #[display("invalid arithmetic coded data")]
    ArithmeticData,
    /// The arithmetic decoder did not end on the expected terminal pattern.
    #[display("arithmetic decoder flush failed")]
    Flush,
    /// Stream parameters (channel count, sample rate, frame size) are unusable.
    #[display("invalid stream parameters: {_0}")]
    InvalidStream(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// Frame data doesn't change between attempts, so this is always `false`.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
