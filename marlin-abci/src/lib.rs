#![forbid(unsafe_code)]

//! Bridges to external chain analyzers. Two request shapes exist
//! depending on chain: a binary length-prefixed spam-check protocol and
//! an HTTP/1.1 JSON-RPC protocol, both over a TCP connection to a local
//! analyzer process.

pub mod jsonrpc;
pub mod length_prefixed;

pub use jsonrpc::{BlockAnalysis, JsonRpcBridge};
pub use length_prefixed::{SpamCheckBridge, Verdict};

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Framing(#[from] marlin_lpf::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("analyzer error: {0}")]
    Analyzer(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
