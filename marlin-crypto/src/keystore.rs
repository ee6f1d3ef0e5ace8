#![forbid(unsafe_code)]

//! Static key persistence. A single file holds the raw 32-byte X25519
//! secret; it is created with a fresh key on first run.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::kdf::StaticKeypair;
use crate::{Error, Result};

/// Load the static keypair from `path`, generating and persisting a new
/// one if the file does not exist yet.
pub fn load_or_generate(path: impl AsRef<Path>) -> Result<StaticKeypair> {
    let path = path.as_ref();
    if path.exists() {
        let bytes = fs::read(path)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::crypto(format!("keystore {}: expected 32 bytes", path.display())))?;
        return Ok(StaticKeypair::from_secret_bytes(secret));
    }

    let keypair = StaticKeypair::generate();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(&keypair.secret_bytes())?;
    info!(path = %path.display(), "generated new static key");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/static");

        let first = load_or_generate(&path).unwrap();
        assert!(path.exists());

        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());
    }

    #[test]
    fn rejects_wrong_length_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static");
        fs::write(&path, [0u8; 7]).unwrap();

        assert!(load_or_generate(&path).is_err());
    }
}
