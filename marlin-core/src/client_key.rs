#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// 20-byte peer identity derived from a static public key (the last 20
/// bytes of the Keccak-256 of the key material).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientKey(pub [u8; 20]);

impl ClientKey {
    /// Derive the identity of a 32-byte static public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Keccak256::digest(public_key);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..32]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for ClientKey {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientKey({self})")
    }
}
