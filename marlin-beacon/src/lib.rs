#![forbid(unsafe_code)]

//! Marlin discovery (beacon) protocol. The server keeps a heartbeat-fed
//! registry of peers; the client registers, asks for peers, probes their
//! protocols, and surfaces `new_peer` events to its delegate.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{BeaconEvent, DiscoveryClient, DiscoveryConfig};
pub use server::DiscoveryServer;
pub use wire::{BeaconMessage, ProtocolEntry};

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
