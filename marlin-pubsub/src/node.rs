#![forbid(unsafe_code)]

//! The pubsub node: owns the stream transport factory, tracks peer slots
//! and channel subscriptions, deduplicates, verifies, witnesses and fans
//! out messages, and churns solicited peers by RTT.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use bytes::Bytes;
use marlin_core::{ClientKey, SocketAddress};
use marlin_lpf::LengthFramer;
use marlin_stream::{StreamTransport, StreamTransportFactory, TransportEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::attestation::{client_key_from_pk, Attester};
use crate::conn_map::{ConnMap, TransportSet};
use crate::dedup::DedupCache;
use crate::frame::{MessageFrame, PubsubFrame};
use crate::witness::Witnesser;
use crate::{Error, Result};

/// Pubsub frames travel on this stream of every peer transport.
const PUBSUB_STREAM: u16 = 0;
/// Cap on one framed pubsub message (blocks included).
const MAX_FRAME: u64 = 64 << 20;

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Cap on solicited connections.
    pub max_sol_conns: usize,
    /// Channels this node subscribes to and serves.
    pub channels: Vec<u16>,
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is stale and its transport is closed.
    pub stale_timeout: Duration,
    pub churn_interval: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            max_sol_conns: 2,
            channels: vec![0],
            heartbeat_interval: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(60),
            churn_interval: Duration::from_secs(60),
        }
    }
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum PubsubEvent {
    DidRecvMessage {
        message_id: u64,
        channel: u16,
        origin: ClientKey,
        payload: Bytes,
    },
    DidSubscribe {
        channel: u16,
        peer: ClientKey,
    },
    DidUnsubscribe {
        channel: u16,
        peer: ClientKey,
    },
}

enum Cmd {
    Subscribe {
        addr: SocketAddress,
        static_pk: [u8; 32],
    },
    Publish {
        channel: u16,
        payload: Bytes,
        message_id: Option<u64>,
    },
    ManageSubscriptions,
}

/// Cloneable application-side handle.
#[derive(Clone)]
pub struct PubSubHandle {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl PubSubHandle {
    /// Dial `addr` and solicit its messages (the beacon's `new_peer`
    /// path).
    pub async fn subscribe(&self, addr: SocketAddress, static_pk: [u8; 32]) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Subscribe { addr, static_pk })
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Publish with a content-addressed message id.
    pub async fn publish(&self, channel: u16, payload: Bytes) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Publish {
                channel,
                payload,
                message_id: None,
            })
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Publish under a caller-chosen message id.
    pub async fn publish_with_id(
        &self,
        channel: u16,
        payload: Bytes,
        message_id: u64,
    ) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Publish {
                channel,
                payload,
                message_id: Some(message_id),
            })
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Trigger a subscription churn pass out of schedule.
    pub async fn manage_subscriptions(&self) -> Result<()> {
        self.cmd_tx
            .send(Cmd::ManageSubscriptions)
            .await
            .map_err(|_| Error::Shutdown)
    }
}

/// 64-bit content address: truncated BLAKE2b of the payload.
pub fn content_message_id(payload: &[u8]) -> u64 {
    let digest = Blake2b::<U8>::digest(payload);
    u64::from_be_bytes(digest.into())
}

pub struct PubSubNode<A: Attester, W: Witnesser> {
    factory: StreamTransportFactory,
    transport_events: mpsc::Receiver<TransportEvent>,
    cmd_rx: mpsc::Receiver<Cmd>,
    event_tx: mpsc::Sender<PubsubEvent>,

    attester: A,
    witnesser: W,
    own_pk: [u8; 32],
    config: PubSubConfig,

    conns: ConnMap,
    /// Channel → peers subscribed to us.
    channel_subscriptions: HashMap<u16, TransportSet>,
    /// Per-peer inbound frame reassembly.
    framers: HashMap<SocketAddress, LengthFramer>,
    peer_keys: HashMap<SocketAddress, ClientKey>,
    last_heartbeat: HashMap<ClientKey, Instant>,
    dedup: DedupCache,
}

impl<A: Attester, W: Witnesser> PubSubNode<A, W> {
    pub fn new(
        factory: StreamTransportFactory,
        transport_events: mpsc::Receiver<TransportEvent>,
        attester: A,
        witnesser: W,
        own_pk: [u8; 32],
        config: PubSubConfig,
    ) -> (Self, PubSubHandle, mpsc::Receiver<PubsubEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let node = Self {
            factory,
            transport_events,
            cmd_rx,
            event_tx,
            attester,
            witnesser,
            own_pk,
            config,
            conns: ConnMap::new(),
            channel_subscriptions: HashMap::new(),
            framers: HashMap::new(),
            peer_keys: HashMap::new(),
            last_heartbeat: HashMap::new(),
            dedup: DedupCache::default(),
        };
        (node, PubSubHandle { cmd_tx }, event_rx)
    }

    /// Start listening and spawn the node task.
    pub fn start(self) -> JoinHandle<()> {
        self.factory.listen();
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut churn = tokio::time::interval(self.config.churn_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        churn.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
                _ = churn.tick() => self.manage_subscriptions(),
            }
        }
        debug!("pubsub node stopped");
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Subscribe { addr, static_pk } => {
                // Slots are assigned once the handshake completes.
                let _ = self.factory.dial(addr, static_pk);
            }
            Cmd::Publish {
                channel,
                payload,
                message_id,
            } => {
                let message_id = message_id.unwrap_or_else(|| content_message_id(&payload));
                if let Err(e) = self.publish(channel, payload, message_id) {
                    warn!(channel, "publish failed: {e}");
                }
            }
            Cmd::ManageSubscriptions => self.manage_subscriptions(),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DidCreateTransport(transport) => {
                trace!(dst = %transport.dst_addr(), "transport created");
            }
            TransportEvent::DidDial(transport) => self.on_established(transport),
            TransportEvent::DidRecv {
                transport,
                stream_id,
                data,
            } => {
                if stream_id == PUBSUB_STREAM {
                    self.on_stream_bytes(transport, data).await;
                }
            }
            TransportEvent::DidClose { transport, reason } => {
                debug!(dst = %transport.dst_addr(), ?reason, "peer transport closed");
                self.forget_peer(transport.dst_addr());
            }
            TransportEvent::DidSend { .. }
            | TransportEvent::DidRecvSkipStream { .. }
            | TransportEvent::DidRecvFlushStream { .. }
            | TransportEvent::DidRecvFlushConf { .. } => {}
        }
    }

    fn on_established(&mut self, transport: StreamTransport) {
        let Some(pk) = transport.remote_static_pk() else {
            warn!(dst = %transport.dst_addr(), "established without a peer key");
            return;
        };
        let key = client_key_from_pk(&pk);
        self.peer_keys.insert(transport.dst_addr(), key);
        self.last_heartbeat.insert(key, Instant::now());

        if transport.is_dialer() {
            // A peer we solicited via the beacon.
            if self.conns.sol_conns.len() < self.config.max_sol_conns {
                self.add_sol_conn(key, transport);
            } else {
                debug!(peer = %key, "solicited slots full, parking on standby");
                self.conns.sol_standby_conns.insert(key, transport);
            }
        } else {
            self.conns.unsol_conns.insert(key, transport);
        }
    }

    fn add_sol_conn(&mut self, key: ClientKey, transport: StreamTransport) {
        info!(peer = %key, dst = %transport.dst_addr(), "soliciting peer");
        for &channel in &self.config.channels {
            send_frame(&transport, &PubsubFrame::Subscribe { channel });
        }
        self.conns.sol_conns.insert(key, transport);
    }

    async fn on_stream_bytes(&mut self, transport: StreamTransport, data: Bytes) {
        let addr = transport.dst_addr();
        let framer = self
            .framers
            .entry(addr)
            .or_insert_with(|| LengthFramer::new(MAX_FRAME));
        let frames = match framer.push(&data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%addr, "bad frame stream, closing: {e}");
                transport.close();
                self.forget_peer(addr);
                return;
            }
        };

        for frame in frames {
            match PubsubFrame::decode(frame, &self.attester, &self.witnesser) {
                Ok(frame) => self.handle_frame(&transport, frame).await,
                Err(e) => debug!(%addr, "undecodable frame dropped: {e}"),
            }
        }
    }

    async fn handle_frame(&mut self, transport: &StreamTransport, frame: PubsubFrame) {
        let Some(&peer) = self.peer_keys.get(&transport.dst_addr()) else {
            return;
        };

        match frame {
            PubsubFrame::Subscribe { channel } => {
                debug!(peer = %peer, channel, "peer subscribed");
                self.channel_subscriptions
                    .entry(channel)
                    .or_default()
                    .insert(peer, transport.clone());
                send_frame(
                    transport,
                    &PubsubFrame::Response {
                        ok: true,
                        text: "subscribed".into(),
                    },
                );
                let _ = self
                    .event_tx
                    .send(PubsubEvent::DidSubscribe { channel, peer })
                    .await;
            }
            PubsubFrame::Unsubscribe { channel } => {
                debug!(peer = %peer, channel, "peer unsubscribed");
                if let Some(set) = self.channel_subscriptions.get_mut(&channel) {
                    set.remove(&peer);
                }
                send_frame(
                    transport,
                    &PubsubFrame::Response {
                        ok: true,
                        text: "unsubscribed".into(),
                    },
                );
                let _ = self
                    .event_tx
                    .send(PubsubEvent::DidUnsubscribe { channel, peer })
                    .await;
            }
            PubsubFrame::Response { ok, text } => {
                debug!(peer = %peer, ok, text, "subscription response");
            }
            PubsubFrame::Heartbeat => {
                self.last_heartbeat.insert(peer, Instant::now());
            }
            PubsubFrame::Message(message) => {
                self.handle_message(peer, message).await;
            }
        }
    }

    /// The §forwarding pipeline: dedup, verify, loop-check, deliver,
    /// fan out.
    async fn handle_message(&mut self, from: ClientKey, message: MessageFrame) {
        let now = Instant::now();

        if self
            .dedup
            .contains(now, message.message_id, message.channel)
        {
            trace!(id = message.message_id, "duplicate message dropped");
            return;
        }

        let Some(origin) = self.attester.verify(
            message.message_id,
            message.channel,
            &message.payload,
            &message.attestation,
        ) else {
            debug!(id = message.message_id, "attestation verify failed");
            return;
        };

        if self.witnesser.contains(&message.witness, &self.own_pk) {
            trace!(id = message.message_id, "witnessed before, loop dropped");
            return;
        }

        self.dedup
            .insert(now, message.message_id, message.channel);

        let _ = self
            .event_tx
            .send(PubsubEvent::DidRecvMessage {
                message_id: message.message_id,
                channel: message.channel,
                origin,
                payload: message.payload.clone(),
            })
            .await;

        if let Err(e) = self.forward(message, Some(from)) {
            warn!("forward failed: {e}");
        }
    }

    fn publish(&mut self, channel: u16, payload: Bytes, message_id: u64) -> Result<()> {
        self.dedup.insert(Instant::now(), message_id, channel);
        self.forward(
            MessageFrame {
                message_id,
                channel,
                attestation: Bytes::new(),
                witness: Bytes::new(),
                payload,
            },
            None,
        )
    }

    /// Re-attest, extend the witness, and send to every solicited and
    /// subscribed peer except the one the message came from.
    fn forward(&mut self, message: MessageFrame, exclude: Option<ClientKey>) -> Result<()> {
        let mut attestation = Vec::new();
        let kept = self.attester.attest(
            message.message_id,
            message.channel,
            &message.payload,
            &message.attestation,
            &mut attestation,
        )?;
        if kept {
            trace!(id = message.message_id, "kept upstream attestation");
        }

        let mut witness = Vec::new();
        self.witnesser.witness(&message.witness, &mut witness)?;

        let out = PubsubFrame::Message(MessageFrame {
            message_id: message.message_id,
            channel: message.channel,
            attestation: attestation.into(),
            witness: witness.into(),
            payload: message.payload,
        });
        let framed: Bytes = LengthFramer::encode(&out.encode()).into();

        let mut sent_to: Vec<ClientKey> = Vec::new();
        let serves_channel = self.config.channels.contains(&message.channel);

        for (key, transport) in self
            .conns
            .sol_conns
            .iter()
            .filter(|_| serves_channel)
            .chain(
                self.channel_subscriptions
                    .get(&message.channel)
                    .into_iter()
                    .flat_map(|set| set.iter()),
            )
        {
            if Some(*key) == exclude || sent_to.contains(key) || transport.is_closed() {
                continue;
            }
            if let Err(e) = transport.send(framed.clone(), PUBSUB_STREAM) {
                debug!(peer = %key, "send failed: {e}");
                continue;
            }
            sent_to.push(*key);
        }
        trace!(
            id = message.message_id,
            fanout = sent_to.len(),
            "message forwarded"
        );
        Ok(())
    }

    fn on_heartbeat_tick(&mut self) {
        let frame = PubsubFrame::Heartbeat;
        let mut targets: Vec<StreamTransport> = Vec::new();
        for (_, t) in self
            .conns
            .sol_conns
            .iter()
            .chain(self.conns.sol_standby_conns.iter())
            .chain(self.conns.unsol_conns.iter())
        {
            targets.push(t.clone());
        }
        for t in targets {
            send_frame(&t, &frame);
        }

        // Stale peers get their transport torn down.
        let now = Instant::now();
        let stale: Vec<(SocketAddress, ClientKey)> = self
            .peer_keys
            .iter()
            .filter(|(_, key)| {
                self.last_heartbeat
                    .get(key)
                    .is_some_and(|&at| now.duration_since(at) > self.config.stale_timeout)
            })
            .map(|(&addr, &key)| (addr, key))
            .collect();
        for (addr, key) in stale {
            info!(peer = %key, %addr, "peer stale, closing");
            if let Some(t) = self.conns.any_transport(&key) {
                t.close();
            }
            self.forget_peer(addr);
        }
    }

    /// RTT-driven churn of the solicited set.
    fn manage_subscriptions(&mut self) {
        self.conns.sol_conns.prune_closed();
        self.conns.sol_standby_conns.prune_closed();
        self.conns.unsol_conns.prune_closed();

        if self.conns.sol_conns.len() >= self.config.max_sol_conns {
            if let Some((key, transport)) = self.conns.sol_conns.find_max_rtt_transport() {
                info!(peer = %key, rtt = ?transport.rtt(), "demoting slowest solicited peer");
                for &channel in &self.config.channels {
                    send_frame(&transport, &PubsubFrame::Unsubscribe { channel });
                }
                self.conns.sol_conns.remove(&key);
                self.conns.sol_standby_conns.insert(key, transport);
            }
        }

        if self.conns.sol_conns.len() < self.config.max_sol_conns {
            if let Some((key, transport)) = self.conns.sol_standby_conns.find_min_rtt_transport() {
                info!(peer = %key, rtt = ?transport.rtt(), "promoting standby peer");
                self.conns.sol_standby_conns.remove(&key);
                self.add_sol_conn(key, transport);
            }
        }
    }

    fn forget_peer(&mut self, addr: SocketAddress) {
        self.framers.remove(&addr);
        if let Some(key) = self.peer_keys.remove(&addr) {
            self.conns.remove_everywhere(&key);
            self.last_heartbeat.remove(&key);
            for set in self.channel_subscriptions.values_mut() {
                set.remove(&key);
            }
        }
        self.factory.erase(&addr);
    }
}

fn send_frame(transport: &StreamTransport, frame: &PubsubFrame) {
    let framed = LengthFramer::encode(&frame.encode());
    if let Err(e) = transport.send(framed.into(), PUBSUB_STREAM) {
        debug!(dst = %transport.dst_addr(), "frame send failed: {e}");
    }
}
