#![forbid(unsafe_code)]

//! Marlin core: byte buffers with header cover/uncover semantics, socket
//! addresses, peer identities, configuration, and the shared error type.

pub mod buffer;
pub mod client_key;
pub mod config;
pub mod error;
pub mod socket_address;

pub use buffer::{Buffer, WeakBuffer};
pub use client_key::ClientKey;
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use socket_address::SocketAddress;
