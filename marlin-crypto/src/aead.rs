#![forbid(unsafe_code)]

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::{Error, Result};

/// AEAD key (zeroized on drop).
#[derive(Clone)]
pub struct AeadKey(pub [u8; 32]);

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// 192-bit XChaCha20 nonce.
#[derive(Clone, Copy)]
pub struct AeadNonce(pub [u8; 24]);

impl AeadNonce {
    /// Nonce for a stream packet: the packet number, big-endian, in the
    /// final 8 bytes. Per-direction keys keep counters independent.
    pub fn from_packet_number(packet_number: u64) -> Self {
        let mut nonce = [0u8; 24];
        nonce[16..24].copy_from_slice(&packet_number.to_be_bytes());
        Self(nonce)
    }
}

/// Packet cipher for one direction of a connection.
pub struct AeadCipher {
    cipher: XChaCha20Poly1305,
}

impl AeadCipher {
    pub fn new(key: &AeadKey) -> Self {
        let key = Key::from_slice(&key.0);
        Self {
            cipher: XChaCha20Poly1305::new(key),
        }
    }

    pub fn seal(&self, nonce: AeadNonce, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XNonce::from_slice(&nonce.0);
        self.cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| Error::Crypto(format!("aead seal failed: {e}")))
    }

    pub fn open(&self, nonce: AeadNonce, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XNonce::from_slice(&nonce.0);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| Error::Crypto(format!("aead open failed: {e}")))
    }
}

/// Authentication tag overhead per sealed payload.
pub const TAG_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = AeadKey([7u8; 32]);
        let cipher = AeadCipher::new(&key);
        let nonce = AeadNonce::from_packet_number(42);
        let aad = b"header bytes";

        let ct = cipher.seal(nonce, aad, b"payload").unwrap();
        assert_eq!(ct.len(), 7 + TAG_SIZE);
        let pt = cipher.open(nonce, aad, &ct).unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn open_fails_with_wrong_aad() {
        let key = AeadKey([3u8; 32]);
        let cipher = AeadCipher::new(&key);
        let nonce = AeadNonce::from_packet_number(1);

        let ct = cipher.seal(nonce, b"A", b"m").unwrap();
        assert!(cipher.open(nonce, b"B", &ct).is_err());
    }

    #[test]
    fn open_fails_with_wrong_packet_number() {
        let key = AeadKey([3u8; 32]);
        let cipher = AeadCipher::new(&key);

        let ct = cipher
            .seal(AeadNonce::from_packet_number(1), b"", b"m")
            .unwrap();
        assert!(cipher
            .open(AeadNonce::from_packet_number(2), b"", &ct)
            .is_err());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let key = AeadKey([9u8; 32]);
        let cipher = AeadCipher::new(&key);
        let nonce = AeadNonce::from_packet_number(5);

        let mut ct = cipher.seal(nonce, b"", b"hello").unwrap();
        ct[0] ^= 0x01;
        assert!(cipher.open(nonce, b"", &ct).is_err());
    }
}
