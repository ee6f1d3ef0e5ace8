#![forbid(unsafe_code)]

//! Relay configuration. Parses a TOML file into a strongly-typed structure;
//! every field has a default so a missing file degrades to a local setup.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result, SocketAddress};

/// Contract set selector for the bridge edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractSet {
    Mainnet,
    Kovan,
}

impl Default for ContractSet {
    fn default() -> Self {
        Self::Mainnet
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the discovery (beacon) client binds to.
    pub discovery_addr: SocketAddress,
    /// Address the pubsub stream transport binds to.
    pub pubsub_addr: SocketAddress,
    /// Address of the beacon server to register with.
    pub beacon_addr: SocketAddress,
    /// Path of the 32-byte static secret key file.
    pub keystore_path: String,
    /// Optional path of the keystore passphrase file.
    pub keystore_pass_path: Option<String>,
    pub contracts: ContractSet,
    /// Cap on solicited pubsub connections.
    pub max_sol_conns: usize,
    /// Protocol number advertised to and accepted from the beacon.
    pub protocol: u32,
    /// Channels to subscribe to on new peers.
    pub channels: Vec<u16>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery_addr: SocketAddress::loopback(8002),
            pubsub_addr: SocketAddress::loopback(8000),
            beacon_addr: SocketAddress::loopback(8003),
            keystore_path: "./.marlin/keys/static".into(),
            keystore_pass_path: None,
            contracts: ContractSet::default(),
            max_sol_conns: 2,
            protocol: 0x1000_0000,
            channels: vec![0],
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sol_conns == 0 {
            return Err(Error::config("max_sol_conns must be at least 1"));
        }
        if self.keystore_path.is_empty() {
            return Err(Error::config("keystore_path must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "pubsub_addr = \"127.0.0.1:9500\"\nmax_sol_conns = 10\ncontracts = \"kovan\""
        )
        .unwrap();

        let config = RelayConfig::from_file(f.path()).unwrap();
        assert_eq!(config.pubsub_addr, SocketAddress::loopback(9500));
        assert_eq!(config.max_sol_conns, 10);
        assert_eq!(config.contracts, ContractSet::Kovan);
        // Untouched fields keep their defaults.
        assert_eq!(config.protocol, 0x1000_0000);
    }

    #[test]
    fn zero_sol_conns_rejected() {
        let config = RelayConfig {
            max_sol_conns: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
