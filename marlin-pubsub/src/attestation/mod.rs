#![forbid(unsafe_code)]

//! Per-message attestation. An attestation travels with the message and
//! proves the origin's identity; relays forward an existing attestation
//! verbatim and only an origin signs afresh.

mod empty;
mod sig;

pub use empty::EmptyAttester;
pub use sig::SigAttester;

use marlin_core::ClientKey;

use crate::Result;

/// Capability set every attester variant provides.
pub trait Attester: Send + 'static {
    /// Bytes the attestation will occupy for this message, including the
    /// length tag.
    fn attestation_size(&self, message_id: u64, channel: u16, payload: &[u8], prev: &[u8])
        -> usize;

    /// Append the attestation to `out`. Returns `true` when an upstream
    /// attestation was kept instead of signing afresh.
    fn attest(
        &self,
        message_id: u64,
        channel: u16,
        payload: &[u8],
        prev: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<bool>;

    /// Check the attestation; `Some(origin)` on success.
    fn verify(
        &self,
        message_id: u64,
        channel: u16,
        payload: &[u8],
        attestation: &[u8],
    ) -> Option<ClientKey>;

    /// Attestation length at the head of `buf`, if recognized.
    fn parse_size(&self, buf: &[u8]) -> Option<usize>;
}

/// Ethereum-style 20-byte identity of a static public key.
pub fn client_key_from_pk(public_key: &[u8; 32]) -> ClientKey {
    ClientKey::from_public_key(public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_key_is_stable_and_distinct() {
        let a = client_key_from_pk(&[1u8; 32]);
        let b = client_key_from_pk(&[1u8; 32]);
        let c = client_key_from_pk(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
