#![forbid(unsafe_code)]

//! Session key schedule: X25519 between the two static keys, then
//! HKDF-SHA256 expansion into one AEAD key per direction. Both peers
//! arrive at the same pair; the dialer transmits with the `i2r` key.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::aead::AeadKey;
use crate::{Error, Result};

const KDF_SALT: &[u8] = b"marlin-stream/v1";
const LBL_I2R: &[u8] = b"marlin-stream/i2r";
const LBL_R2I: &[u8] = b"marlin-stream/r2i";

/// Long-term X25519 keypair.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Directional keys for one established connection.
pub struct SessionKeys {
    /// Key protecting initiator-to-responder packets.
    pub i2r: AeadKey,
    /// Key protecting responder-to-initiator packets.
    pub r2i: AeadKey,
}

/// Derive the directional keys. `initiator_conn_id`/`responder_conn_id`
/// are each side's `src_conn_id`, binding the keys to this connection
/// incarnation.
pub fn derive_session_keys(
    our_static: &StaticKeypair,
    remote_static_pk: &[u8; 32],
    initiator_conn_id: u32,
    responder_conn_id: u32,
) -> Result<SessionKeys> {
    let remote = PublicKey::from(*remote_static_pk);
    let shared = our_static.secret.diffie_hellman(&remote);

    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.as_bytes());

    let mut info_i2r = Vec::with_capacity(LBL_I2R.len() + 8);
    info_i2r.extend_from_slice(LBL_I2R);
    info_i2r.extend_from_slice(&initiator_conn_id.to_be_bytes());
    info_i2r.extend_from_slice(&responder_conn_id.to_be_bytes());

    let mut info_r2i = Vec::with_capacity(LBL_R2I.len() + 8);
    info_r2i.extend_from_slice(LBL_R2I);
    info_r2i.extend_from_slice(&initiator_conn_id.to_be_bytes());
    info_r2i.extend_from_slice(&responder_conn_id.to_be_bytes());

    let mut i2r = [0u8; 32];
    hk.expand(&info_i2r, &mut i2r)
        .map_err(|e| Error::Crypto(format!("hkdf expand failed: {e}")))?;
    let mut r2i = [0u8; 32];
    hk.expand(&info_r2i, &mut r2i)
        .map_err(|e| Error::Crypto(format!("hkdf expand failed: {e}")))?;

    Ok(SessionKeys {
        i2r: AeadKey(i2r),
        r2i: AeadKey(r2i),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();

        let ka = derive_session_keys(&a, &b.public_bytes(), 11, 22).unwrap();
        let kb = derive_session_keys(&b, &a.public_bytes(), 11, 22).unwrap();

        assert_eq!(ka.i2r.0, kb.i2r.0);
        assert_eq!(ka.r2i.0, kb.r2i.0);
        assert_ne!(ka.i2r.0, ka.r2i.0);
    }

    #[test]
    fn conn_ids_separate_incarnations() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();

        let k1 = derive_session_keys(&a, &b.public_bytes(), 1, 2).unwrap();
        let k2 = derive_session_keys(&a, &b.public_bytes(), 1, 3).unwrap();
        assert_ne!(k1.i2r.0, k2.i2r.0);
    }

    #[test]
    fn secret_roundtrips_through_bytes() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::from_secret_bytes(a.secret_bytes());
        assert_eq!(a.public_bytes(), b.public_bytes());
    }
}
