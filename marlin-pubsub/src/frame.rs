#![forbid(unsafe_code)]

//! Pubsub frames. Each frame travels as one length-prefixed unit on
//! stream 0 of the peer's stream transport:
//!
//! ```text
//! SUBSCRIBE    | 0 | channel (2 BE) |
//! UNSUBSCRIBE  | 1 | channel (2 BE) |
//! RESPONSE     | 2 | ok (1) | text |
//! MESSAGE      | 3 | message_id (8 BE) | channel (2 BE) | payload |
//! HEARTBEAT    | 4 |
//! MESSAGE_WITH | 5 | message_id (8 BE) | channel (2 BE) | attestation
//!  _HEADERS        | witness | payload |
//! ```
//!
//! Attestation and witness carry their own 2-byte LE length tags; their
//! extents are recovered through the attester/witnesser `parse_size`
//! capabilities.

use bytes::{BufMut, Bytes, BytesMut};

use crate::attestation::Attester;
use crate::witness::Witnesser;
use crate::{Error, Result};

pub const FRAME_SUBSCRIBE: u8 = 0;
pub const FRAME_UNSUBSCRIBE: u8 = 1;
pub const FRAME_RESPONSE: u8 = 2;
pub const FRAME_MESSAGE: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 4;
pub const FRAME_MESSAGE_WITH_HEADERS: u8 = 5;

/// A full gossip message with its relay headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub message_id: u64,
    pub channel: u16,
    pub attestation: Bytes,
    pub witness: Bytes,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubsubFrame {
    Subscribe { channel: u16 },
    Unsubscribe { channel: u16 },
    Response { ok: bool, text: String },
    Heartbeat,
    Message(MessageFrame),
}

impl PubsubFrame {
    /// Encode for the wire. Message frames always use the
    /// MESSAGE_WITH_HEADERS shape; the headerless MESSAGE form is
    /// accepted on decode only.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Self::Subscribe { channel } => {
                out.put_u8(FRAME_SUBSCRIBE);
                out.put_u16(*channel);
            }
            Self::Unsubscribe { channel } => {
                out.put_u8(FRAME_UNSUBSCRIBE);
                out.put_u16(*channel);
            }
            Self::Response { ok, text } => {
                out.put_u8(FRAME_RESPONSE);
                out.put_u8(u8::from(*ok));
                out.put_slice(text.as_bytes());
            }
            Self::Heartbeat => {
                out.put_u8(FRAME_HEARTBEAT);
            }
            Self::Message(message) => {
                out.put_u8(FRAME_MESSAGE_WITH_HEADERS);
                out.put_u64(message.message_id);
                out.put_u16(message.channel);
                out.put_slice(&message.attestation);
                out.put_slice(&message.witness);
                out.put_slice(&message.payload);
            }
        }
        out.freeze()
    }

    /// Decode one frame. Attestation/witness extents come from the
    /// node's configured attester and witnesser.
    pub fn decode<A: Attester, W: Witnesser>(
        frame: Bytes,
        attester: &A,
        witnesser: &W,
    ) -> Result<Self> {
        let Some(&frame_type) = frame.first() else {
            return Err(Error::frame("empty frame"));
        };
        let body = frame.slice(1..);

        match frame_type {
            FRAME_SUBSCRIBE | FRAME_UNSUBSCRIBE => {
                if body.len() < 2 {
                    return Err(Error::frame("short subscribe frame"));
                }
                let channel = u16::from_be_bytes([body[0], body[1]]);
                Ok(if frame_type == FRAME_SUBSCRIBE {
                    Self::Subscribe { channel }
                } else {
                    Self::Unsubscribe { channel }
                })
            }
            FRAME_RESPONSE => {
                if body.is_empty() {
                    return Err(Error::frame("short response frame"));
                }
                let ok = body[0] != 0;
                let text = String::from_utf8_lossy(&body[1..]).into_owned();
                Ok(Self::Response { ok, text })
            }
            FRAME_HEARTBEAT => Ok(Self::Heartbeat),
            FRAME_MESSAGE => {
                if body.len() < 10 {
                    return Err(Error::frame("short message frame"));
                }
                let message_id = u64::from_be_bytes(
                    body[0..8].try_into().map_err(|_| Error::frame("bad id"))?,
                );
                let channel = u16::from_be_bytes([body[8], body[9]]);
                Ok(Self::Message(MessageFrame {
                    message_id,
                    channel,
                    attestation: Bytes::new(),
                    witness: Bytes::new(),
                    payload: body.slice(10..),
                }))
            }
            FRAME_MESSAGE_WITH_HEADERS => {
                if body.len() < 10 {
                    return Err(Error::frame("short message frame"));
                }
                let message_id = u64::from_be_bytes(
                    body[0..8].try_into().map_err(|_| Error::frame("bad id"))?,
                );
                let channel = u16::from_be_bytes([body[8], body[9]]);

                let rest = body.slice(10..);
                let att_size = attester
                    .parse_size(&rest)
                    .ok_or_else(|| Error::frame("unrecognized attestation"))?;
                if rest.len() < att_size {
                    return Err(Error::frame("truncated attestation"));
                }
                let attestation = rest.slice(..att_size);

                let rest = rest.slice(att_size..);
                let wit_size = witnesser
                    .parse_size(&rest)
                    .ok_or_else(|| Error::frame("unrecognized witness"))?;
                if rest.len() < wit_size {
                    return Err(Error::frame("truncated witness"));
                }
                let witness = rest.slice(..wit_size);
                let payload = rest.slice(wit_size..);

                Ok(Self::Message(MessageFrame {
                    message_id,
                    channel,
                    attestation,
                    witness,
                    payload,
                }))
            }
            other => Err(Error::frame(format!("unknown frame type {other}"))),
        }
    }
}
