use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stream: {0}")]
    Stream(#[from] marlin_stream::Error),
    #[error("framing: {0}")]
    Framing(#[from] marlin_lpf::Error),
    #[error("frame: {0}")]
    Frame(String),
    #[error("attestation: {0}")]
    Attestation(String),
    #[error("node shut down")]
    Shutdown,
}

impl Error {
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }
    pub fn attestation(msg: impl Into<String>) -> Self {
        Self::Attestation(msg.into())
    }
}
