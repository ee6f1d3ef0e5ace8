#![forbid(unsafe_code)]

//! Beacon client: registers with the beacon server, asks it for peers,
//! probes each peer's protocols, and surfaces matching peers as
//! [`BeaconEvent::NewPeer`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marlin_core::{Buffer, ClientKey, SocketAddress};
use marlin_transport::{DatagramHandler, UdpFiber};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::wire::{BeaconMessage, ProtocolEntry};
use crate::Result;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Beacon server to register with and query.
    pub beacon_addr: SocketAddress,
    /// Whether to heartbeat (relays yes, pure clients no).
    pub is_discoverable: bool,
    /// Protocols advertised to peers that probe us.
    pub protocols: Vec<ProtocolEntry>,
    pub heartbeat_interval: Duration,
    pub discovery_interval: Duration,
}

impl DiscoveryConfig {
    pub fn new(beacon_addr: SocketAddress) -> Self {
        Self {
            beacon_addr,
            is_discoverable: true,
            protocols: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            discovery_interval: Duration::from_secs(60),
        }
    }
}

/// Peer discovery output, one event per advertised protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconEvent {
    NewPeer {
        client_key: ClientKey,
        addr: SocketAddress,
        static_pk: [u8; 32],
        protocol: u32,
        version: u16,
    },
}

pub struct DiscoveryClient {
    udp: UdpFiber,
    local_addr: SocketAddress,
    rx: mpsc::Receiver<(SocketAddress, Buffer)>,
    event_tx: mpsc::Sender<BeaconEvent>,
    config: DiscoveryConfig,
    static_pk: [u8; 32],
    /// Keys learned from LISTPEER, keyed by the probe address.
    probed: HashMap<SocketAddress, [u8; 32]>,
}

struct Ingest {
    tx: mpsc::Sender<(SocketAddress, Buffer)>,
}

#[async_trait]
impl DatagramHandler for Ingest {
    async fn did_recv(&self, src: SocketAddress, datagram: Buffer) {
        let _ = self.tx.send((src, datagram)).await;
    }
}

impl DiscoveryClient {
    pub async fn bind(
        addr: SocketAddress,
        static_pk: [u8; 32],
        config: DiscoveryConfig,
    ) -> Result<(Self, mpsc::Receiver<BeaconEvent>)> {
        let udp = UdpFiber::bind(addr).await?;
        let local_addr = udp.local_addr()?;
        let (tx, rx) = mpsc::channel(1024);
        let (event_tx, event_rx) = mpsc::channel(256);
        udp.listen(Arc::new(Ingest { tx }));
        info!(%local_addr, beacon = %config.beacon_addr, "beacon client up");
        Ok((
            Self {
                udp,
                local_addr,
                rx,
                event_tx,
                config,
                static_pk,
                probed: HashMap::new(),
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.local_addr
    }

    /// Kick off periodic discovery and heartbeats.
    pub fn start_discovery(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut discover = tokio::time::interval(self.config.discovery_interval);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        discover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                datagram = self.rx.recv() => match datagram {
                    Some((src, datagram)) => self.handle(src, datagram).await,
                    None => break,
                },
                _ = discover.tick() => {
                    debug!(beacon = %self.config.beacon_addr, "DISCPEER >>>");
                    self.udp.send(self.config.beacon_addr, BeaconMessage::DiscPeer.encode());
                }
                _ = heartbeat.tick() => {
                    if self.config.is_discoverable {
                        self.udp.send(
                            self.config.beacon_addr,
                            BeaconMessage::Heartbeat { static_pk: self.static_pk }.encode(),
                        );
                    }
                }
            }
        }
    }

    async fn handle(&mut self, src: SocketAddress, datagram: Buffer) {
        let message = match BeaconMessage::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(%src, "bad beacon datagram: {e}");
                return;
            }
        };

        match message {
            BeaconMessage::ListPeer(peers) => {
                debug!(%src, count = peers.len(), "LISTPEER <<<");
                for (addr, static_pk) in peers {
                    if addr == self.local_addr {
                        continue;
                    }
                    self.probed.insert(addr, static_pk);
                    self.udp.send(addr, BeaconMessage::DiscProto.encode());
                }
            }
            BeaconMessage::DiscProto => {
                debug!(%src, "DISCPROTO <<<");
                self.udp.send(
                    src,
                    BeaconMessage::ListProto(self.config.protocols.clone()).encode(),
                );
            }
            BeaconMessage::ListProto(entries) => {
                let Some(&static_pk) = self.probed.get(&src) else {
                    debug!(%src, "LISTPROTO from unprobed peer ignored");
                    return;
                };
                let client_key = ClientKey::from_public_key(&static_pk);
                for entry in entries {
                    let mut addr = src;
                    addr.set_port(entry.port);
                    let event = BeaconEvent::NewPeer {
                        client_key,
                        addr,
                        static_pk,
                        protocol: entry.protocol,
                        version: entry.version,
                    };
                    if self.event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            BeaconMessage::DiscPeer | BeaconMessage::Heartbeat { .. } => {
                // Server-side messages; not for us.
            }
        }
    }
}
