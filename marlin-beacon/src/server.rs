#![forbid(unsafe_code)]

//! Beacon server: registers nodes that heartbeat and answers DISCPEER
//! with a sample of live peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use marlin_core::{Buffer, SocketAddress};
use marlin_transport::{DatagramHandler, UdpFiber};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::wire::BeaconMessage;
use crate::Result;

/// Peers silent for longer than this are dropped from the registry.
const STALE_AFTER: Duration = Duration::from_secs(120);
/// Registry sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Peers returned per DISCPEER.
const LISTPEER_SAMPLE: usize = 8;

struct PeerRecord {
    static_pk: [u8; 32],
    last_heartbeat: Instant,
}

pub struct DiscoveryServer {
    udp: UdpFiber,
    local_addr: SocketAddress,
    rx: mpsc::Receiver<(SocketAddress, Buffer)>,
    peers: HashMap<SocketAddress, PeerRecord>,
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

impl DiscoveryServer {
    pub async fn bind(addr: SocketAddress) -> Result<Self> {
        let udp = UdpFiber::bind(addr).await?;
        let local_addr = udp.local_addr()?;
        let (tx, rx) = mpsc::channel(1024);
        udp.listen(Arc::new(Ingest { tx }));
        info!(%local_addr, "beacon server up");
        Ok(Self {
            udp,
            local_addr,
            rx,
            peers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.local_addr
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                datagram = self.rx.recv() => match datagram {
                    Some((src, datagram)) => self.handle(src, datagram),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    fn handle(&mut self, src: SocketAddress, datagram: Buffer) {
        let message = match BeaconMessage::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(%src, "bad beacon datagram: {e}");
                return;
            }
        };

        match message {
            BeaconMessage::Heartbeat { static_pk } => {
                debug!(%src, "HEARTBEAT");
                self.peers.insert(
                    src,
                    PeerRecord {
                        static_pk,
                        last_heartbeat: Instant::now(),
                    },
                );
            }
            BeaconMessage::DiscPeer => {
                debug!(%src, "DISCPEER");
                let mut candidates: Vec<(SocketAddress, [u8; 32])> = self
                    .peers
                    .iter()
                    .filter(|(&addr, _)| addr != src)
                    .map(|(&addr, record)| (addr, record.static_pk))
                    .collect();
                candidates.shuffle(&mut rand::thread_rng());
                candidates.truncate(LISTPEER_SAMPLE);
                self.udp
                    .send(src, BeaconMessage::ListPeer(candidates).encode());
            }
            BeaconMessage::DiscProto => {
                // The server advertises no overlay protocols of its own.
                self.udp.send(src, BeaconMessage::ListProto(Vec::new()).encode());
            }
            BeaconMessage::ListProto(_) | BeaconMessage::ListPeer(_) => {
                debug!(%src, "unexpected beacon reply ignored");
            }
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let before = self.peers.len();
        self.peers
            .retain(|_, record| now.duration_since(record.last_heartbeat) < STALE_AFTER);
        if self.peers.len() != before {
            info!(
                evicted = before - self.peers.len(),
                live = self.peers.len(),
                "beacon registry swept"
            );
        }
    }
}
