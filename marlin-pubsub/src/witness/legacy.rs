#![forbid(unsafe_code)]

use super::{set_bit, test_bit, Witnesser, LEGACY_WITNESS_SIZE, WITNESS_SIZE};
use crate::{Error, Result};

/// Accepts both the tagged 34-byte witness and the tagless 32-byte legacy
/// form on receive, but always emits the tagged form.
pub struct LegacyWitnesser {
    public_key: [u8; 32],
}

impl LegacyWitnesser {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self { public_key }
    }

    fn bloom_of(witness: &[u8]) -> Option<&[u8]> {
        match witness.len() {
            WITNESS_SIZE => Some(&witness[2..WITNESS_SIZE]),
            LEGACY_WITNESS_SIZE => Some(witness),
            _ => None,
        }
    }
}

impl Witnesser for LegacyWitnesser {
    fn witness_size(&self, _prev: &[u8]) -> usize {
        WITNESS_SIZE
    }

    fn contains(&self, witness: &[u8], public_key: &[u8; 32]) -> bool {
        let Some(bloom) = Self::bloom_of(witness) else {
            return false;
        };
        public_key[..8].iter().all(|&idx| test_bit(bloom, idx))
    }

    fn witness(&self, prev: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let base = out.len();
        out.extend_from_slice(&(WITNESS_SIZE as u16).to_le_bytes());
        match prev.len() {
            0 => out.extend_from_slice(&[0u8; 32]),
            WITNESS_SIZE => out.extend_from_slice(&prev[2..WITNESS_SIZE]),
            LEGACY_WITNESS_SIZE => out.extend_from_slice(prev),
            _ => return Err(Error::frame("witness: unexpected length")),
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
        if tag as usize == WITNESS_SIZE {
            Some(WITNESS_SIZE)
        } else {
            Some(LEGACY_WITNESS_SIZE)
        }
    }
}
