#![forbid(unsafe_code)]

//! Framing fibers for byte-stream edges: a length-prefixed framer for the
//! bridge RPC protocol and a sentinel framer for line-oriented headers.
//! Both are incremental — feed arbitrary chunks, collect whole frames.

pub mod length;
pub mod sentinel;

pub use length::LengthFramer;
pub use sentinel::SentinelFramer;

use thiserror::Error as ThisError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("framing: frame of {got} bytes exceeds cap {cap}")]
    FrameTooLarge { got: u64, cap: u64 },
}
