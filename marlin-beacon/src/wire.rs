#![forbid(unsafe_code)]

//! Beacon datagrams: a version byte, a type byte, then the type-specific
//! body. All integers big-endian.
//!
//! ```text
//! DISCPROTO  | 0 | 0 |
//! LISTPROTO  | 0 | 1 | count (1) | (protocol u32, version u16, port u16) × count |
//! DISCPEER   | 0 | 2 |
//! LISTPEER   | 0 | 3 | (addr 8B, static_pk 32B) × n |
//! HEARTBEAT  | 0 | 4 | static_pk 32B |
//! ```

use marlin_core::{Buffer, SocketAddress};

use crate::{Error, Result};

pub const BEACON_VERSION: u8 = 0;

pub const TYPE_DISCPROTO: u8 = 0;
pub const TYPE_LISTPROTO: u8 = 1;
pub const TYPE_DISCPEER: u8 = 2;
pub const TYPE_LISTPEER: u8 = 3;
pub const TYPE_HEARTBEAT: u8 = 4;

/// One advertised protocol: number, version, and the port it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub protocol: u32,
    pub version: u16,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconMessage {
    DiscProto,
    ListProto(Vec<ProtocolEntry>),
    DiscPeer,
    ListPeer(Vec<(SocketAddress, [u8; 32])>),
    Heartbeat { static_pk: [u8; 32] },
}

impl BeaconMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![BEACON_VERSION];
        match self {
            Self::DiscProto => out.push(TYPE_DISCPROTO),
            Self::ListProto(entries) => {
                out.push(TYPE_LISTPROTO);
                out.push(entries.len() as u8);
                for entry in entries {
                    out.extend_from_slice(&entry.protocol.to_be_bytes());
                    out.extend_from_slice(&entry.version.to_be_bytes());
                    out.extend_from_slice(&entry.port.to_be_bytes());
                }
            }
            Self::DiscPeer => out.push(TYPE_DISCPEER),
            Self::ListPeer(peers) => {
                out.push(TYPE_LISTPEER);
                for (addr, pk) in peers {
                    out.extend_from_slice(&addr.to_bytes());
                    out.extend_from_slice(pk);
                }
            }
            Self::Heartbeat { static_pk } => {
                out.push(TYPE_HEARTBEAT);
                out.extend_from_slice(static_pk);
            }
        }
        out
    }

    pub fn decode(datagram: &Buffer) -> Result<Self> {
        let bytes = datagram.as_slice();
        if bytes.len() < 2 {
            return Err(Error::protocol("beacon: short datagram"));
        }
        if bytes[0] != BEACON_VERSION {
            return Err(Error::protocol("beacon: version mismatch"));
        }
        let body = &bytes[2..];

        match bytes[1] {
            TYPE_DISCPROTO => Ok(Self::DiscProto),
            TYPE_LISTPROTO => {
                let Some((&count, mut rest)) = body.split_first() else {
                    return Err(Error::protocol("beacon: short listproto"));
                };
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    if rest.len() < 8 {
                        return Err(Error::protocol("beacon: truncated listproto"));
                    }
                    entries.push(ProtocolEntry {
                        protocol: u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]),
                        version: u16::from_be_bytes([rest[4], rest[5]]),
                        port: u16::from_be_bytes([rest[6], rest[7]]),
                    });
                    rest = &rest[8..];
                }
                Ok(Self::ListProto(entries))
            }
            TYPE_DISCPEER => Ok(Self::DiscPeer),
            TYPE_LISTPEER => {
                const ENTRY: usize = SocketAddress::SERIALIZED_SIZE + 32;
                if body.len() % ENTRY != 0 {
                    return Err(Error::protocol("beacon: truncated listpeer"));
                }
                let mut peers = Vec::with_capacity(body.len() / ENTRY);
                for chunk in body.chunks_exact(ENTRY) {
                    let addr = SocketAddress::deserialize(&chunk[..8])
                        .map_err(|e| Error::protocol(e.to_string()))?;
                    let mut pk = [0u8; 32];
                    pk.copy_from_slice(&chunk[8..]);
                    peers.push((addr, pk));
                }
                Ok(Self::ListPeer(peers))
            }
            TYPE_HEARTBEAT => {
                if body.len() < 32 {
                    return Err(Error::protocol("beacon: short heartbeat"));
                }
                let mut static_pk = [0u8; 32];
                static_pk.copy_from_slice(&body[..32]);
                Ok(Self::Heartbeat { static_pk })
            }
            other => Err(Error::protocol(format!("beacon: unknown type {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: BeaconMessage) {
        let wire = message.encode();
        let decoded = BeaconMessage::decode(&Buffer::from_vec(wire)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn all_messages_roundtrip() {
        roundtrip(BeaconMessage::DiscProto);
        roundtrip(BeaconMessage::DiscPeer);
        roundtrip(BeaconMessage::ListProto(vec![ProtocolEntry {
            protocol: 0x1000_0000,
            version: 1,
            port: 8000,
        }]));
        roundtrip(BeaconMessage::ListPeer(vec![
            (SocketAddress::loopback(9000), [7u8; 32]),
            (SocketAddress::loopback(9001), [9u8; 32]),
        ]));
        roundtrip(BeaconMessage::Heartbeat {
            static_pk: [3u8; 32],
        });
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut wire = BeaconMessage::DiscPeer.encode();
        wire[0] = 9;
        assert!(BeaconMessage::decode(&Buffer::from_vec(wire)).is_err());
    }

    #[test]
    fn truncated_listpeer_rejected() {
        let mut wire = BeaconMessage::ListPeer(vec![(SocketAddress::loopback(1), [0u8; 32])])
            .encode();
        wire.pop();
        assert!(BeaconMessage::decode(&Buffer::from_vec(wire)).is_err());
    }
}
