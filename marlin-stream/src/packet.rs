#![forbid(unsafe_code)]

//! Stream packet layout. One packet per UDP datagram, 28-byte header,
//! big-endian fields:
//!
//! ```text
//! 0   : 1 : version
//! 1   : 1 : type (fin flag folded into the data type)
//! 2   : 4 : src_conn_id
//! 6   : 4 : dst_conn_id
//! 10  : 2 : stream_id (range count for ACK packets)
//! 12  : 8 : packet_number
//! 20  : 8 : stream offset (largest_acked for ACK packets)
//! 28  : N : payload
//! ```
//!
//! After the handshake the payload is AEAD-sealed with the header as
//! associated data and the packet number as nonce.

use marlin_core::Buffer;

use crate::{Error, Result};

/// Header length, version byte included.
pub const HEADER_SIZE: usize = 28;

/// Largest DATA payload per packet; also the MSS used by the congestion
/// controller.
pub const MAX_PAYLOAD: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    DataFin = 1,
    Ack = 2,
    Dial = 3,
    DialConf = 4,
    Conf = 5,
    Rst = 6,
    SkipStream = 7,
    FlushStream = 8,
    FlushConf = 9,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Data,
            1 => Self::DataFin,
            2 => Self::Ack,
            3 => Self::Dial,
            4 => Self::DialConf,
            5 => Self::Conf,
            6 => Self::Rst,
            7 => Self::SkipStream,
            8 => Self::FlushStream,
            9 => Self::FlushConf,
            _ => return None,
        })
    }

    /// Packets that must elicit an acknowledgement.
    pub fn is_ack_eliciting(self) -> bool {
        matches!(self, Self::Data | Self::DataFin)
    }
}

/// Read-only view over a received datagram (version byte already
/// verified, still in place).
pub struct StreamPacket(pub Buffer);

impl StreamPacket {
    pub fn parse(buffer: Buffer) -> Result<Self> {
        if buffer.size() < HEADER_SIZE {
            return Err(Error::protocol("stream packet: short header"));
        }
        Ok(Self(buffer))
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.0.read_u8_unsafe(1))
    }

    pub fn is_fin_set(&self) -> bool {
        self.0.read_u8_unsafe(1) == PacketType::DataFin as u8
    }

    pub fn src_conn_id(&self) -> u32 {
        self.0.read_u32_be_unsafe(2)
    }

    pub fn dst_conn_id(&self) -> u32 {
        self.0.read_u32_be_unsafe(6)
    }

    pub fn stream_id(&self) -> u16 {
        self.0.read_u16_be_unsafe(10)
    }

    /// ACK packets reuse the stream id slot for the range count.
    pub fn range_count(&self) -> u16 {
        self.stream_id()
    }

    pub fn packet_number(&self) -> u64 {
        self.0.read_u64_be_unsafe(12)
    }

    pub fn stream_offset(&self) -> u64 {
        self.0.read_u64_be_unsafe(20)
    }

    /// ACK packets reuse the offset slot for the largest acked number.
    pub fn largest_acked(&self) -> u64 {
        self.stream_offset()
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.0.as_slice()[..HEADER_SIZE]
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.as_slice()[HEADER_SIZE..]
    }

    /// Consume, leaving only the payload in the buffer.
    pub fn into_payload(mut self) -> Buffer {
        self.0.cover_unsafe(HEADER_SIZE);
        self.0
    }
}

/// Header fields for an outbound packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub src_conn_id: u32,
    pub dst_conn_id: u32,
    pub stream_id: u16,
    pub packet_number: u64,
    pub stream_offset: u64,
}

impl PacketHeader {
    pub fn encode(&self, payload: &[u8]) -> Buffer {
        let mut buf = Buffer::new(HEADER_SIZE + payload.len());
        marlin_transport::write_version(&mut buf);
        buf.write_u8_unsafe(1, self.packet_type as u8);
        buf.write_u32_be_unsafe(2, self.src_conn_id);
        buf.write_u32_be_unsafe(6, self.dst_conn_id);
        buf.write_u16_be_unsafe(10, self.stream_id);
        buf.write_u64_be_unsafe(12, self.packet_number);
        buf.write_u64_be_unsafe(20, self.stream_offset);
        buf.write_unsafe(HEADER_SIZE, payload);
        buf
    }
}

/// Decoded ACK contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckInfo {
    pub largest_acked: u64,
    pub ack_delay_micros: u64,
    /// Alternating run lengths, acked first, starting at `largest_acked`
    /// and walking down.
    pub ranges: Vec<u64>,
}

impl AckInfo {
    /// Payload layout: `ack_delay_micros (8 BE) | range (8 BE) × count`.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 * self.ranges.len());
        out.extend_from_slice(&self.ack_delay_micros.to_be_bytes());
        for r in &self.ranges {
            out.extend_from_slice(&r.to_be_bytes());
        }
        out
    }

    pub fn decode(largest_acked: u64, range_count: u16, payload: &[u8]) -> Result<Self> {
        if range_count == 0 {
            return Err(Error::protocol("ack: empty ranges"));
        }
        let expect = 8 + 8 * range_count as usize;
        if payload.len() < expect {
            return Err(Error::protocol("ack: short payload"));
        }
        let ack_delay_micros = u64::from_be_bytes(
            payload[0..8]
                .try_into()
                .map_err(|_| Error::protocol("ack: bad delay"))?,
        );
        let mut ranges = Vec::with_capacity(range_count as usize);
        for i in 0..range_count as usize {
            let at = 8 + 8 * i;
            let run = u64::from_be_bytes(
                payload[at..at + 8]
                    .try_into()
                    .map_err(|_| Error::protocol("ack: bad range"))?,
            );
            ranges.push(run);
        }
        Ok(Self {
            largest_acked,
            ack_delay_micros,
            ranges,
        })
    }

    /// Expand into every acked packet number described by the ranges.
    pub fn acked_packet_numbers(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cursor = self.largest_acked;
        let mut acked_run = true;
        let mut exhausted = false;
        for &run in &self.ranges {
            for _ in 0..run {
                if acked_run {
                    out.push(cursor);
                }
                if cursor == 0 {
                    exhausted = true;
                    break;
                }
                cursor -= 1;
            }
            if exhausted {
                break;
            }
            acked_run = !acked_run;
        }
        out
    }
}

/// Quick peek at the type byte before a connection is looked up.
pub fn peek_type(datagram: &Buffer) -> Option<PacketType> {
    datagram.read_u8(1).and_then(PacketType::from_u8)
}
