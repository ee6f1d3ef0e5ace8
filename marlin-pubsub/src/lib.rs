#![forbid(unsafe_code)]

//! Marlin pubsub node: channel-based publish/subscribe over the reliable
//! stream transport, with per-message attestation, Bloom-filter witness
//! loop prevention, dedup, and solicited/unsolicited peer management.

pub mod attestation;
pub mod conn_map;
pub mod dedup;
pub mod errors;
pub mod frame;
pub mod node;
pub mod witness;

pub use attestation::{client_key_from_pk, Attester, EmptyAttester, SigAttester};
pub use dedup::DedupCache;
pub use errors::{Error, Result};
pub use frame::{MessageFrame, PubsubFrame};
pub use node::{content_message_id, PubSubConfig, PubSubHandle, PubSubNode, PubsubEvent};
pub use witness::{LegacyWitnesser, LpfBloomWitnesser, Witnesser};

/// Pubsub protocol numbers advertised through the beacon.
pub const MASTER_PUBSUB_PROTOCOL_NUMBER: u32 = 0x1000_0000;
pub const RELAY_PUBSUB_PROTOCOL_NUMBER: u32 = 0x1000_0001;
pub const CLIENT_PUBSUB_PROTOCOL_NUMBER: u32 = 0x1000_0002;
