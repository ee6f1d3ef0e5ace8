#![forbid(unsafe_code)]

//! Marlin reliable stream transport: multi-stream ordered delivery over
//! UDP with a 3-way handshake, per-packet authenticated encryption,
//! selective acknowledgement, NewReno congestion control, and timer-based
//! loss recovery.

pub mod ack_ranges;
pub mod congestion;
pub mod connection;
pub mod errors;
pub mod manager;
pub mod packet;
pub mod recv_stream;
pub mod rtt;
pub mod send_stream;
pub mod transport;

pub use ack_ranges::AckRanges;
pub use connection::{CloseReason, ConnEvent, Connection, ConnectionState};
pub use errors::{Error, Result};
pub use packet::{PacketType, StreamPacket};
pub use transport::{StreamTransport, StreamTransportFactory, TransportEvent};
