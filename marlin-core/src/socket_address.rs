#![forbid(unsafe_code)]

//! IPv4 socket address with an 8-byte wire form.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Address family tag used in the wire form.
const AF_INET: u16 = 2;

/// IPv4 address + port. The all-zero value is the "unknown" sentinel.
///
/// Wire form is 8 bytes: family (2 BE), address (4, network order),
/// port (2 BE). Serde form is the `ip:port` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketAddress {
    ip: [u8; 4],
    port: u16,
}

impl Serialize for SocketAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SocketAddress {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl SocketAddress {
    pub const SERIALIZED_SIZE: usize = 8;

    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: ip.octets(),
            port,
        }
    }

    /// The zero sentinel.
    pub fn unknown() -> Self {
        Self {
            ip: [0; 4],
            port: 0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.ip == [0; 4] && self.port == 0
    }

    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn from_string(s: &str) -> Result<Self> {
        s.parse()
    }

    pub fn serialize(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < Self::SERIALIZED_SIZE {
            return Err(Error::protocol("socket address: serialize buffer too small"));
        }
        out[0..2].copy_from_slice(&AF_INET.to_be_bytes());
        out[2..6].copy_from_slice(&self.ip);
        out[6..8].copy_from_slice(&self.port.to_be_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut out = [0u8; Self::SERIALIZED_SIZE];
        out[0..2].copy_from_slice(&AF_INET.to_be_bytes());
        out[2..6].copy_from_slice(&self.ip);
        out[6..8].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SERIALIZED_SIZE {
            return Err(Error::protocol("socket address: short input"));
        }
        let family = u16::from_be_bytes([bytes[0], bytes[1]]);
        if family != AF_INET {
            return Err(Error::protocol(format!(
                "socket address: unsupported family {family}"
            )));
        }
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&bytes[2..6]);
        let port = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok(Self { ip, port })
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl FromStr for SocketAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let sa: SocketAddrV4 = s
            .parse()
            .map_err(|_| Error::protocol(format!("socket address: bad literal {s:?}")))?;
        Ok(Self::new(*sa.ip(), sa.port()))
    }
}

impl From<SocketAddrV4> for SocketAddress {
    fn from(sa: SocketAddrV4) -> Self {
        Self::new(*sa.ip(), sa.port())
    }
}

impl From<SocketAddress> for SocketAddr {
    fn from(addr: SocketAddress) -> Self {
        SocketAddr::V4(SocketAddrV4::new(addr.ip(), addr.port))
    }
}

impl TryFrom<SocketAddr> for SocketAddress {
    type Error = Error;

    fn try_from(sa: SocketAddr) -> Result<Self> {
        match sa {
            SocketAddr::V4(v4) => Ok(Self::from(v4)),
            SocketAddr::V6(_) => Err(Error::protocol("socket address: ipv6 unsupported")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let addr = SocketAddress::from_string("192.168.0.1:8000").unwrap();
        assert_eq!(addr.to_string(), "192.168.0.1:8000");
        assert_eq!(SocketAddress::from_string(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn bad_literals_rejected() {
        assert!(SocketAddress::from_string("not an address").is_err());
        assert!(SocketAddress::from_string("1.2.3.4").is_err());
        assert!(SocketAddress::from_string("[::1]:80").is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let addr = SocketAddress::from_string("10.0.0.7:9000").unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(bytes[0..2], [0, 2]);
        assert_eq!(bytes[2..6], [10, 0, 0, 7]);
        assert_eq!(SocketAddress::deserialize(&bytes).unwrap(), addr);
    }

    #[test]
    fn short_input_rejected() {
        assert!(SocketAddress::deserialize(&[0u8; 7]).is_err());
    }

    #[test]
    fn zero_is_unknown() {
        assert!(SocketAddress::unknown().is_unknown());
        assert!(!SocketAddress::loopback(1).is_unknown());
    }

    #[test]
    fn ordering_is_total() {
        let a = SocketAddress::from_string("1.2.3.4:10").unwrap();
        let b = SocketAddress::from_string("1.2.3.4:11").unwrap();
        let c = SocketAddress::from_string("2.0.0.0:1").unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
