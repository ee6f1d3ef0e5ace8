#![forbid(unsafe_code)]

//! Connection core: handshake state machine, packet protection, stream
//! multiplexing, acknowledgement and loss recovery. Sans-io — callers
//! feed datagrams, commands and the clock in, then drain outbound
//! datagrams and delegate events out. The async shell in
//! [`crate::transport`] owns one of these per peer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use marlin_core::{Buffer, SocketAddress};
use marlin_crypto::{derive_session_keys, AeadCipher, AeadNonce, StaticKeypair};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::ack_ranges::AckRanges;
use crate::congestion::CongestionCtrl;
use crate::packet::{AckInfo, PacketHeader, PacketType, StreamPacket, MAX_PAYLOAD};
use crate::recv_stream::RecvStream;
use crate::rtt::{RttEstimator, MAX_RTO};
use crate::send_stream::SendStream;
use crate::{Error, Result};

/// Delay before an elicited ACK goes out on its own.
const ACK_DELAY: Duration = Duration::from_millis(25);
/// Unacked ack-eliciting packets that force an immediate ACK.
const ACK_PACKET_THRESHOLD: u32 = 2;
/// Idle interval before an ACK-only keepalive.
const KEEPALIVE: Duration = Duration::from_secs(10);
/// Handshake retransmit schedule: base doubling up to the cap, then fail.
const HANDSHAKE_BASE: Duration = Duration::from_secs(1);
const HANDSHAKE_CAP: Duration = Duration::from_secs(64);
/// Consecutive retransmission timeouts before the connection dies.
const MAX_CONSECUTIVE_RTO: u32 = 8;
/// Packet-threshold loss detection (reordering tolerance).
const LOSS_REORDER_THRESHOLD: u64 = 3;
/// Cap on encoded ack ranges per ACK packet.
const ACK_RANGES_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listen,
    DialSent,
    DialRecvd,
    Established,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Remote,
    HandshakeTimeout,
    RtoTimeout,
}

/// Events surfaced to the transport delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Established,
    DidRecv {
        stream_id: u16,
        data: Bytes,
    },
    DidSend {
        stream_id: u16,
    },
    DidRecvSkipStream {
        stream_id: u16,
    },
    DidRecvFlushStream {
        stream_id: u16,
        offset: u64,
        old_offset: u64,
    },
    DidRecvFlushConf {
        stream_id: u16,
    },
    DidClose {
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Copy)]
struct SentPacketInfo {
    sent_time: Instant,
    stream_id: u16,
    stream_offset: u64,
    length: u16,
}

pub struct Connection {
    pub src_addr: SocketAddress,
    pub dst_addr: SocketAddress,
    state: ConnectionState,
    is_dialer: bool,

    src_conn_id: u32,
    dst_conn_id: u32,

    keypair: StaticKeypair,
    remote_static_pk: Option<[u8; 32]>,
    tx_cipher: Option<AeadCipher>,
    rx_cipher: Option<AeadCipher>,

    send_streams: HashMap<u16, SendStream>,
    recv_streams: HashMap<u16, RecvStream>,
    send_order: VecDeque<u16>,

    next_packet_number: u64,
    sent_packets: BTreeMap<u64, SentPacketInfo>,
    largest_acked_packet: u64,

    ack_ranges: AckRanges,
    unacked_eliciting: u32,
    ack_timeout: Option<Instant>,
    last_elicited: Option<Instant>,

    congestion: CongestionCtrl,
    rtt: RttEstimator,

    rto_backoff: u32,
    state_timeout: Option<Instant>,
    handshake_attempts: u32,
    keepalive_at: Option<Instant>,

    transmits: VecDeque<Vec<u8>>,
    events: VecDeque<ConnEvent>,
}

impl Connection {
    /// Dial `dst`; the remote static key must be known up front.
    pub fn new_dialer(
        src_addr: SocketAddress,
        dst_addr: SocketAddress,
        keypair: StaticKeypair,
        remote_static_pk: [u8; 32],
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(src_addr, dst_addr, keypair, Some(remote_static_pk), true);
        conn.src_conn_id = rand::thread_rng().gen_range(1..=u32::MAX);
        conn.state = ConnectionState::DialSent;
        conn.handshake_attempts = 1;
        conn.state_timeout = Some(now + HANDSHAKE_BASE);
        conn.send_dial();
        conn
    }

    /// Accept side; the remote key is learned from the DIAL payload.
    pub fn new_listener(
        src_addr: SocketAddress,
        dst_addr: SocketAddress,
        keypair: StaticKeypair,
    ) -> Self {
        Self::new(src_addr, dst_addr, keypair, None, false)
    }

    fn new(
        src_addr: SocketAddress,
        dst_addr: SocketAddress,
        keypair: StaticKeypair,
        remote_static_pk: Option<[u8; 32]>,
        is_dialer: bool,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            state: ConnectionState::Listen,
            is_dialer,
            src_conn_id: 0,
            dst_conn_id: 0,
            keypair,
            remote_static_pk,
            tx_cipher: None,
            rx_cipher: None,
            send_streams: HashMap::new(),
            recv_streams: HashMap::new(),
            send_order: VecDeque::new(),
            next_packet_number: 1,
            sent_packets: BTreeMap::new(),
            largest_acked_packet: 0,
            ack_ranges: AckRanges::new(),
            unacked_eliciting: 0,
            ack_timeout: None,
            last_elicited: None,
            congestion: CongestionCtrl::new(),
            rtt: RttEstimator::new(),
            rto_backoff: 0,
            state_timeout: None,
            handshake_attempts: 0,
            keepalive_at: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    //-------- Accessors --------//

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub fn remote_static_pk(&self) -> Option<[u8; 32]> {
        self.remote_static_pk
    }

    pub fn rtt(&self) -> Duration {
        self.rtt.smoothed_rtt()
    }

    /// Drain one outbound datagram.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmits.pop_front()
    }

    /// Drain one delegate event.
    pub fn poll_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    //-------- Application operations --------//

    /// Queue `data` on `stream_id` and send as the window allows.
    pub fn send(&mut self, data: Bytes, stream_id: u16, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let stream = self
            .send_streams
            .entry(stream_id)
            .or_insert_with(|| SendStream::new(stream_id));
        if stream.done_queueing {
            return Err(Error::protocol("send on flushed stream"));
        }
        stream.enqueue(data);
        if !self.send_order.contains(&stream_id) {
            self.send_order.push_back(stream_id);
        }
        self.fill_transmits(now);
        Ok(())
    }

    /// No more data on this stream; FIN goes out with the last chunk, or
    /// as an empty DATA+FIN when everything already went on the wire.
    pub fn flush_stream(&mut self, stream_id: u16, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let Some(stream) = self.send_streams.get_mut(&stream_id) else {
            return Ok(());
        };
        stream.flush();
        let already_sent = stream.fully_sent();
        let end_offset = stream.queue_offset;

        if stream.is_complete() {
            // Everything was acked before the flush; no ack is coming to
            // report completion.
            self.send_streams.remove(&stream_id);
            self.send_control(PacketType::DataFin, stream_id, end_offset, now);
            self.events.push_back(ConnEvent::DidSend { stream_id });
        } else if already_sent {
            self.send_control(PacketType::DataFin, stream_id, end_offset, now);
        } else {
            self.fill_transmits(now);
        }
        Ok(())
    }

    /// Abandon unacked data on the stream and tell the receiver to jump
    /// past it.
    pub fn skip_stream(&mut self, stream_id: u16, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let offset = match self.send_streams.get_mut(&stream_id) {
            Some(stream) => {
                let offset = stream.queue_offset;
                stream.skip();
                offset
            }
            None => 0,
        };
        // In-flight accounting for this stream is void now.
        let stale: Vec<u64> = self
            .sent_packets
            .iter()
            .filter(|(_, info)| info.stream_id == stream_id)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in stale {
            if let Some(info) = self.sent_packets.remove(&pn) {
                self.congestion.on_ack(info.length as usize);
            }
        }
        self.send_control(PacketType::SkipStream, stream_id, offset, now);
        Ok(())
    }

    /// Reader-side request to skip past everything currently received on
    /// the stream; the sender answers FLUSH_CONF.
    pub fn request_flush(&mut self, stream_id: u16, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let offset = self
            .recv_streams
            .get(&stream_id)
            .map(|s| s.recv_offset)
            .unwrap_or(0);
        self.send_control(PacketType::FlushStream, stream_id, offset, now);
        Ok(())
    }

    /// Close the connection. Idempotent; an RST is sent best-effort.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        if self.state == ConnectionState::Established {
            let header = self.header(PacketType::Rst, 0, 0, 0);
            self.transmits.push_back(header.encode(&[]).into_vec());
        }
        self.enter_closing(reason);
    }

    fn enter_closing(&mut self, reason: CloseReason) {
        self.state = ConnectionState::Closing;
        self.state_timeout = None;
        self.ack_timeout = None;
        self.keepalive_at = None;
        self.sent_packets.clear();
        self.events.push_back(ConnEvent::DidClose { reason });
    }

    //-------- Timers --------//

    /// Earliest pending deadline, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                next = Some(match next {
                    Some(n) => n.min(t),
                    None => t,
                });
            }
        };
        consider(self.state_timeout);
        consider(self.ack_timeout);
        consider(self.rto_deadline());
        consider(self.keepalive_at);
        next
    }

    fn rto_deadline(&self) -> Option<Instant> {
        let earliest = self.sent_packets.values().map(|i| i.sent_time).min()?;
        let rto = self
            .rtt
            .rto()
            .saturating_mul(1 << self.rto_backoff.min(6))
            .min(MAX_RTO);
        Some(earliest + rto)
    }

    /// Fire whichever deadlines have passed.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }

        if self.state_timeout.is_some_and(|t| t <= now) {
            self.on_handshake_timeout(now);
        }

        if self.rto_deadline().is_some_and(|t| t <= now) {
            self.on_retransmit_timeout(now);
        }

        if self.ack_timeout.is_some_and(|t| t <= now) {
            self.send_ack(now);
        }

        if self.keepalive_at.is_some_and(|t| t <= now) {
            self.keepalive_at = Some(now + KEEPALIVE);
            if !self.ack_ranges.is_empty() {
                self.send_ack(now);
            }
        }
    }

    fn on_handshake_timeout(&mut self, now: Instant) {
        let delay = HANDSHAKE_BASE * (1u32 << self.handshake_attempts.min(20));
        if delay > HANDSHAKE_CAP {
            debug!(dst = %self.dst_addr, "handshake timed out");
            self.enter_closing(CloseReason::HandshakeTimeout);
            return;
        }
        self.handshake_attempts += 1;
        self.state_timeout = Some(now + delay.min(HANDSHAKE_CAP));
        match self.state {
            ConnectionState::DialSent => self.send_dial(),
            ConnectionState::DialRecvd => self.send_dial_conf(),
            _ => {
                self.state_timeout = None;
            }
        }
    }

    fn on_retransmit_timeout(&mut self, now: Instant) {
        let Some((&pn, _)) = self.sent_packets.iter().min_by_key(|(_, i)| i.sent_time) else {
            return;
        };
        let Some(info) = self.sent_packets.remove(&pn) else {
            return;
        };
        trace!(pn, "retransmission timeout");

        self.rto_backoff += 1;
        if self.rto_backoff >= MAX_CONSECUTIVE_RTO {
            self.close(CloseReason::RtoTimeout);
            return;
        }

        if let Some(stream) = self.send_streams.get_mut(&info.stream_id) {
            stream.on_lost(info.stream_offset, info.length as u64);
            if !self.send_order.contains(&info.stream_id) {
                self.send_order.push_back(info.stream_id);
            }
        }
        self.congestion
            .on_loss(now, info.sent_time, info.length as usize, self.rtt.smoothed_rtt());
        self.congestion.on_rto_reset();
        self.fill_transmits(now);
    }

    //-------- Inbound --------//

    /// Process one datagram (version byte still in place).
    pub fn handle_datagram(&mut self, now: Instant, mut datagram: Buffer) {
        if !marlin_transport::strip_version(&mut datagram) {
            return;
        }
        // Restore so header offsets match the packet layout.
        datagram.uncover_unsafe(1);

        let Ok(pkt) = StreamPacket::parse(datagram) else {
            return;
        };
        let Some(packet_type) = pkt.packet_type() else {
            return;
        };

        match packet_type {
            PacketType::Dial => self.handle_dial(now, pkt),
            PacketType::DialConf => self.handle_dial_conf(now, pkt),
            PacketType::Conf => self.handle_conf(now, pkt),
            PacketType::Rst => {
                if self.state != ConnectionState::Listen {
                    self.enter_closing(CloseReason::Remote);
                }
            }
            _ => self.handle_protected(now, packet_type, pkt),
        }
    }

    fn handle_dial(&mut self, now: Instant, pkt: StreamPacket) {
        let payload = pkt.payload();
        if payload.len() < 32 {
            return;
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&payload[..32]);

        match self.state {
            ConnectionState::Listen => {
                if self.remote_static_pk.is_some_and(|pinned| pinned != pk) {
                    warn!(dst = %self.dst_addr, "dial with unexpected static key");
                    return;
                }
                self.remote_static_pk = Some(pk);
                self.dst_conn_id = pkt.src_conn_id();
                self.src_conn_id = rand::thread_rng().gen_range(1..=u32::MAX);

                // Dialer's conn id first: it is the initiator.
                match derive_session_keys(
                    &self.keypair,
                    &pk,
                    self.dst_conn_id,
                    self.src_conn_id,
                ) {
                    Ok(keys) => {
                        self.tx_cipher = Some(AeadCipher::new(&keys.r2i));
                        self.rx_cipher = Some(AeadCipher::new(&keys.i2r));
                    }
                    Err(e) => {
                        warn!("session key derivation failed: {e}");
                        return;
                    }
                }

                self.state = ConnectionState::DialRecvd;
                self.handshake_attempts = 1;
                self.state_timeout = Some(now + HANDSHAKE_BASE);
                self.send_dial_conf();
            }
            ConnectionState::DialRecvd | ConnectionState::Established => {
                // DIAL retransmit; answer again.
                if pkt.src_conn_id() == self.dst_conn_id {
                    self.send_dial_conf();
                }
            }
            _ => {}
        }
    }

    fn handle_dial_conf(&mut self, now: Instant, pkt: StreamPacket) {
        match self.state {
            ConnectionState::DialSent => {
                if pkt.dst_conn_id() != self.src_conn_id {
                    return;
                }
                let payload = pkt.payload();
                if payload.len() < 32 {
                    return;
                }
                let mut pk = [0u8; 32];
                pk.copy_from_slice(&payload[..32]);
                if self.remote_static_pk.is_some_and(|pinned| pinned != pk) {
                    warn!(dst = %self.dst_addr, "dial conf with unexpected static key");
                    return;
                }

                self.dst_conn_id = pkt.src_conn_id();
                match derive_session_keys(
                    &self.keypair,
                    &pk,
                    self.src_conn_id,
                    self.dst_conn_id,
                ) {
                    Ok(keys) => {
                        self.tx_cipher = Some(AeadCipher::new(&keys.i2r));
                        self.rx_cipher = Some(AeadCipher::new(&keys.r2i));
                    }
                    Err(e) => {
                        warn!("session key derivation failed: {e}");
                        return;
                    }
                }

                self.send_conf();
                self.establish(now);
            }
            ConnectionState::Established => {
                // Our CONF was lost; repeat it.
                if pkt.src_conn_id() == self.dst_conn_id && self.is_dialer {
                    self.send_conf();
                }
            }
            _ => {}
        }
    }

    fn handle_conf(&mut self, now: Instant, pkt: StreamPacket) {
        if self.state != ConnectionState::DialRecvd {
            return;
        }
        if pkt.src_conn_id() != self.dst_conn_id || pkt.dst_conn_id() != self.src_conn_id {
            return;
        }
        self.establish(now);
    }

    fn establish(&mut self, now: Instant) {
        self.state = ConnectionState::Established;
        self.state_timeout = None;
        self.keepalive_at = Some(now + KEEPALIVE);
        self.events.push_back(ConnEvent::Established);
        self.fill_transmits(now);
    }

    fn handle_protected(&mut self, now: Instant, packet_type: PacketType, pkt: StreamPacket) {
        // The listener's CONF may be lost while the dialer moves on to
        // data; any validly protected packet is an implicit CONF.
        if self.state == ConnectionState::DialRecvd {
            if pkt.src_conn_id() != self.dst_conn_id || pkt.dst_conn_id() != self.src_conn_id {
                return;
            }
            self.establish(now);
        }
        if self.state != ConnectionState::Established {
            return;
        }
        if pkt.src_conn_id() != self.dst_conn_id || pkt.dst_conn_id() != self.src_conn_id {
            // Stale or spoofed traffic; drop silently.
            return;
        }

        let Some(rx) = &self.rx_cipher else { return };
        let nonce = AeadNonce::from_packet_number(pkt.packet_number());
        let plaintext = match rx.open(nonce, pkt.header_bytes(), pkt.payload()) {
            Ok(pt) => pt,
            Err(_) => {
                trace!(dst = %self.dst_addr, "bad packet mac");
                return;
            }
        };

        match packet_type {
            PacketType::Data | PacketType::DataFin => {
                self.handle_data(now, &pkt, plaintext.into())
            }
            PacketType::Ack => self.handle_ack(now, &pkt, &plaintext),
            PacketType::SkipStream => self.handle_skip_stream(&pkt),
            PacketType::FlushStream => self.handle_flush_stream(now, &pkt),
            PacketType::FlushConf => {
                self.events.push_back(ConnEvent::DidRecvFlushConf {
                    stream_id: pkt.stream_id(),
                });
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, now: Instant, pkt: &StreamPacket, data: Bytes) {
        let stream_id = pkt.stream_id();
        let pn = pkt.packet_number();
        let fin = pkt.is_fin_set();

        self.ack_ranges.add_packet_number(pn);
        self.unacked_eliciting += 1;
        if self.last_elicited.is_none() {
            self.last_elicited = Some(now);
        }

        let stream = self
            .recv_streams
            .entry(stream_id)
            .or_insert_with(|| RecvStream::new(stream_id));
        for chunk in stream.on_data(pkt.stream_offset(), data, fin) {
            self.events.push_back(ConnEvent::DidRecv {
                stream_id,
                data: chunk,
            });
        }

        if self.unacked_eliciting >= ACK_PACKET_THRESHOLD {
            self.send_ack(now);
        } else if self.ack_timeout.is_none() {
            self.ack_timeout = Some(now + ACK_DELAY);
        }
    }

    fn handle_ack(&mut self, now: Instant, pkt: &StreamPacket, payload: &[u8]) {
        let Ok(info) = AckInfo::decode(pkt.largest_acked(), pkt.range_count(), payload) else {
            return;
        };
        let ack_delay = Duration::from_micros(info.ack_delay_micros);

        let mut newly_acked = false;
        let mut largest_newly_acked: Option<(u64, SentPacketInfo)> = None;
        for pn in info.acked_packet_numbers() {
            let Some(sent) = self.sent_packets.remove(&pn) else {
                continue;
            };
            newly_acked = true;
            if largest_newly_acked.as_ref().map(|(l, _)| pn > *l).unwrap_or(true) {
                largest_newly_acked = Some((pn, sent));
            }
            self.largest_acked_packet = self.largest_acked_packet.max(pn);
            self.congestion.on_ack(sent.length as usize);

            if let Some(stream) = self.send_streams.get_mut(&sent.stream_id) {
                stream.on_ack(sent.stream_offset, sent.length as u64);
                if stream.is_complete() {
                    self.events.push_back(ConnEvent::DidSend {
                        stream_id: sent.stream_id,
                    });
                    self.send_streams.remove(&sent.stream_id);
                }
            }
        }

        if let Some((pn, sent)) = largest_newly_acked {
            if pn == info.largest_acked {
                let sample = now
                    .saturating_duration_since(sent.sent_time)
                    .saturating_sub(ack_delay);
                if sample > Duration::ZERO {
                    self.rtt.on_sample(sample);
                }
            }
        }

        if newly_acked {
            self.rto_backoff = 0;
            self.detect_losses(now);
            self.fill_transmits(now);
        }
    }

    fn detect_losses(&mut self, now: Instant) {
        let loss_delay = self.rtt.loss_delay();
        let threshold = self
            .largest_acked_packet
            .saturating_sub(LOSS_REORDER_THRESHOLD);

        let lost: Vec<u64> = self
            .sent_packets
            .iter()
            .filter(|(&pn, info)| {
                pn < self.largest_acked_packet
                    && (pn < threshold || info.sent_time + loss_delay < now)
            })
            .map(|(&pn, _)| pn)
            .collect();

        for pn in lost {
            let Some(info) = self.sent_packets.remove(&pn) else {
                continue;
            };
            debug!(pn, stream_id = info.stream_id, "packet declared lost");
            if let Some(stream) = self.send_streams.get_mut(&info.stream_id) {
                stream.on_lost(info.stream_offset, info.length as u64);
                if !self.send_order.contains(&info.stream_id) {
                    self.send_order.push_back(info.stream_id);
                }
            }
            self.congestion
                .on_loss(now, info.sent_time, info.length as usize, self.rtt.smoothed_rtt());
        }
    }

    fn handle_skip_stream(&mut self, pkt: &StreamPacket) {
        let stream_id = pkt.stream_id();
        let stream = self
            .recv_streams
            .entry(stream_id)
            .or_insert_with(|| RecvStream::new(stream_id));
        stream.on_skip(pkt.stream_offset());
        self.events
            .push_back(ConnEvent::DidRecvSkipStream { stream_id });
    }

    fn handle_flush_stream(&mut self, now: Instant, pkt: &StreamPacket) {
        let stream_id = pkt.stream_id();
        let offset = pkt.stream_offset();
        let old_offset = self
            .send_streams
            .get(&stream_id)
            .map(|s| s.acked_offset)
            .unwrap_or(0);
        if let Some(stream) = self.send_streams.get_mut(&stream_id) {
            stream.flush_to(offset);
        }
        self.send_control(PacketType::FlushConf, stream_id, offset, now);
        self.events.push_back(ConnEvent::DidRecvFlushStream {
            stream_id,
            offset,
            old_offset,
        });
    }

    //-------- Outbound --------//

    fn header(
        &self,
        packet_type: PacketType,
        stream_id: u16,
        packet_number: u64,
        stream_offset: u64,
    ) -> PacketHeader {
        PacketHeader {
            packet_type,
            src_conn_id: self.src_conn_id,
            dst_conn_id: self.dst_conn_id,
            stream_id,
            packet_number,
            stream_offset,
        }
    }

    fn send_dial(&mut self) {
        let header = self.header(PacketType::Dial, 0, 0, 0);
        let packet = header.encode(&self.keypair.public_bytes());
        self.transmits.push_back(packet.into_vec());
    }

    fn send_dial_conf(&mut self) {
        let header = self.header(PacketType::DialConf, 0, 0, 0);
        let packet = header.encode(&self.keypair.public_bytes());
        self.transmits.push_back(packet.into_vec());
    }

    fn send_conf(&mut self) {
        let header = self.header(PacketType::Conf, 0, 0, 0);
        self.transmits.push_back(header.encode(&[]).into_vec());
    }

    /// Seal and queue a protected packet.
    fn seal_and_queue(
        &mut self,
        now: Instant,
        packet_type: PacketType,
        stream_id: u16,
        stream_offset: u64,
        plaintext: &[u8],
    ) -> Option<u64> {
        let tx = self.tx_cipher.as_ref()?;
        let pn = self.next_packet_number;
        self.next_packet_number += 1;

        let header = self.header(packet_type, stream_id, pn, stream_offset);
        let header_buf = header.encode(&[]);
        let nonce = AeadNonce::from_packet_number(pn);
        let sealed = match tx.seal(nonce, header_buf.as_slice(), plaintext) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("packet seal failed: {e}");
                return None;
            }
        };

        let mut out = header_buf.into_vec();
        out.extend_from_slice(&sealed);
        self.transmits.push_back(out);
        self.keepalive_at = self.keepalive_at.map(|_| now + KEEPALIVE);
        Some(pn)
    }

    fn send_control(&mut self, packet_type: PacketType, stream_id: u16, offset: u64, now: Instant) {
        let _ = self.seal_and_queue(now, packet_type, stream_id, offset, &[]);
    }

    fn send_ack(&mut self, now: Instant) {
        self.ack_timeout = None;
        self.unacked_eliciting = 0;
        if self.ack_ranges.is_empty() || self.tx_cipher.is_none() {
            return;
        }

        let ranges = self.ack_ranges.encode(ACK_RANGES_MAX);
        let delay = self
            .last_elicited
            .take()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);
        let info = AckInfo {
            largest_acked: self.ack_ranges.largest,
            ack_delay_micros: delay.as_micros() as u64,
            ranges: ranges.clone(),
        };
        let payload = info.encode_payload();
        let _ = self.seal_and_queue(
            now,
            PacketType::Ack,
            ranges.len() as u16,
            info.largest_acked,
            &payload,
        );
    }

    /// Move stream data onto the wire while the congestion window allows.
    fn fill_transmits(&mut self, now: Instant) {
        if self.state != ConnectionState::Established {
            return;
        }

        loop {
            let budget = self
                .congestion
                .cwnd()
                .saturating_sub(self.congestion.bytes_in_flight());
            let max = (budget as usize).min(MAX_PAYLOAD);
            if max == 0 {
                break;
            }

            // Round-robin across streams with pending data.
            let Some(&stream_id) = self.send_order.front() else {
                break;
            };
            let Some(stream) = self.send_streams.get_mut(&stream_id) else {
                self.send_order.pop_front();
                continue;
            };
            let Some(chunk) = stream.pop_chunk(max) else {
                self.send_order.pop_front();
                continue;
            };
            if stream.has_pending() {
                self.send_order.rotate_left(1);
            } else {
                self.send_order.pop_front();
            }

            let packet_type = if chunk.fin {
                PacketType::DataFin
            } else {
                PacketType::Data
            };
            let length = chunk.data.len() as u16;
            let Some(pn) =
                self.seal_and_queue(now, packet_type, stream_id, chunk.offset, &chunk.data)
            else {
                break;
            };

            self.congestion.on_send(length as usize);
            self.sent_packets.insert(
                pn,
                SentPacketInfo {
                    sent_time: now,
                    stream_id,
                    stream_offset: chunk.offset,
                    length,
                },
            );
        }
    }
}
