//! DST (Direct Stream Transfer) decoding.
//!
//! DST is the lossless compression used for one-bit DSD audio on SACD. Each
//! frame covers 1/75th of a second and is either stored verbatim or coded as
//! the residual of a per-channel linear predictor, compressed with a binary
//! arithmetic coder driven by adaptive probability tables.
//!
//! [`DstDecoder`] decodes one frame at a time on the calling thread;
//! [`ParallelDecoder`] pipelines frames across a ring of worker threads
//! while keeping output in submission order.

pub mod ac;
pub mod bits;
mod decoder;
pub mod error;
pub mod filter;
pub mod header;
mod parallel;
#[cfg(test)]
mod testutil;

pub use decoder::DstDecoder;
pub use error::{Error, ErrorKind, Result};
pub use header::StreamInfo;
pub use parallel::{ParallelDecoder, SILENCE};
