#![forbid(unsafe_code)]

use tracing::trace;

use super::{set_bit, test_bit, Witnesser, WITNESS_SIZE};
use crate::{Error, Result};

/// Standard 34-byte witness: 2-byte length tag (34, LE) plus a 256-bit
/// Bloom filter. A key sets eight bits, indexed by its first eight bytes.
pub struct LpfBloomWitnesser {
    public_key: [u8; 32],
}

impl LpfBloomWitnesser {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self { public_key }
    }
}

impl Witnesser for LpfBloomWitnesser {
    fn witness_size(&self, _prev: &[u8]) -> usize {
        WITNESS_SIZE
    }

    fn contains(&self, witness: &[u8], public_key: &[u8; 32]) -> bool {
        if witness.len() < WITNESS_SIZE {
            return false;
        }
        let bloom = &witness[2..WITNESS_SIZE];
        public_key[..8].iter().all(|&idx| test_bit(bloom, idx))
    }

    fn witness(&self, prev: &[u8], out: &mut Vec<u8>) -> Result<()> {
        trace!("bloom witness");
        let base = out.len();
        if prev.is_empty() {
            out.extend_from_slice(&(WITNESS_SIZE as u16).to_le_bytes());
            out.extend_from_slice(&[0u8; 32]);
        } else if prev.len() == WITNESS_SIZE {
            out.extend_from_slice(prev);
        } else {
            return Err(Error::frame("witness: unexpected length"));
        }

        let bloom = &mut out[base + 2..base + WITNESS_SIZE];
        for &idx in &self.public_key[..8] {
            set_bit(bloom, idx);
        }
        Ok(())
    }

    fn parse_size(&self, buf: &[u8]) -> Option<usize> {
        if buf.len() < 2 {
            return None;
        }
        let tag = u16::from_le_bytes([buf[0], buf[1]]);
        (tag as usize == WITNESS_SIZE).then_some(WITNESS_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_witness_contains_own_key() {
        let pk = [0xabu8; 32];
        let witnesser = LpfBloomWitnesser::new(pk);

        let mut witness = Vec::new();
        witnesser.witness(&[], &mut witness).unwrap();
        assert_eq!(witness.len(), WITNESS_SIZE);
        assert_eq!(witness[0], 34);

        assert!(witnesser.contains(&witness, &pk));
        assert!(!witnesser.contains(&witness, &[0x01u8; 32]));
    }

    #[test]
    fn extension_preserves_previous_relays() {
        let pk1: [u8; 32] = core::array::from_fn(|i| i as u8);
        let pk2: [u8; 32] = core::array::from_fn(|i| 100 + i as u8);
        let w1 = LpfBloomWitnesser::new(pk1);
        let w2 = LpfBloomWitnesser::new(pk2);

        let mut first = Vec::new();
        w1.witness(&[], &mut first).unwrap();
        let mut second = Vec::new();
        w2.witness(&first, &mut second).unwrap();

        assert!(w1.contains(&second, &pk1));
        assert!(w1.contains(&second, &pk2));
    }

    #[test]
    fn parse_size_requires_tag() {
        let witnesser = LpfBloomWitnesser::new([0u8; 32]);
        assert_eq!(witnesser.parse_size(&[34, 0]), Some(34));
        assert_eq!(witnesser.parse_size(&[32, 0]), None);
    }
}
