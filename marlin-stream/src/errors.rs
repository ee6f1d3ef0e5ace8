use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto: {0}")]
    Crypto(#[from] marlin_crypto::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("transport closed")]
    Closed,
    #[error("unknown transport {0}")]
    UnknownTransport(marlin_core::SocketAddress),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
