#![forbid(unsafe_code)]

//! Marlin cryptography engine: XChaCha20-Poly1305 packet sealing, the
//! X25519 + HKDF session key schedule, and the on-disk static keystore.

pub mod aead;
pub mod kdf;
pub mod keystore;

pub use aead::{AeadCipher, AeadKey, AeadNonce};
pub use kdf::{derive_session_keys, SessionKeys, StaticKeypair};
pub use keystore::load_or_generate;

use thiserror::Error as ThisError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto: {0}")]
    Crypto(String),
}

impl Error {
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }
}
