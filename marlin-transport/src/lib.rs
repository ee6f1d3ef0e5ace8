#![forbid(unsafe_code)]

//! Marlin UDP transport adapter.
//!
//! * Single `UdpSocket` bound with address reuse.
//! * Async receive loop dispatches datagrams to a handler trait.
//! * Bounded send queue; datagrams that cannot be queued are dropped and
//!   left to the reliable layer to retransmit.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use marlin_core::{Buffer, SocketAddress};
use socket2::{Domain, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub mod version;

pub use version::{strip_version, write_version, WIRE_VERSION};

/// Maximum datagram size (min-MTU assumption).
pub const MAX_DATAGRAM: usize = 1400;

/// Trait for components that consume inbound datagrams.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn did_recv(&self, src: SocketAddress, datagram: Buffer);
}

/// UDP fiber: owns the socket, surfaces `(src, bytes)` upward and queues
/// sends downward.
#[derive(Clone)]
pub struct UdpFiber {
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<(SocketAddress, Vec<u8>)>,
}

impl UdpFiber {
    /// Bind and start the TX loop. RX starts once a handler is attached
    /// via [`UdpFiber::listen`].
    pub async fn bind(addr: SocketAddress) -> std::io::Result<Self> {
        let addr: SocketAddr = addr.into();
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);

        let (tx, mut rx) = mpsc::channel::<(SocketAddress, Vec<u8>)>(1024);
        let tx_sock = socket.clone();
        tokio::spawn(async move {
            while let Some((addr, data)) = rx.recv().await {
                if let Err(e) = tx_sock.send_to(&data, SocketAddr::from(addr)).await {
                    error!("udp send error: {e}");
                }
            }
        });

        info!("udp fiber bound on {}", socket.local_addr()?);
        Ok(Self { socket, tx })
    }

    /// Spawn the RX loop dispatching datagrams to `handler`.
    pub fn listen<H: DatagramHandler>(&self, handler: Arc<H>) {
        let rx_sock = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match rx_sock.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        let src = match SocketAddress::try_from(src) {
                            Ok(src) => src,
                            // v6 peers are outside the address model
                            Err(_) => continue,
                        };
                        handler
                            .did_recv(src, Buffer::from_vec(buf[..len].to_vec()))
                            .await;
                    }
                    Err(e) => {
                        error!("udp recv error: {e}");
                    }
                }
            }
        });
    }

    /// Queue a datagram. Dropped (with a debug log) when the queue is
    /// full; the reliable layer above retransmits.
    pub fn send(&self, addr: SocketAddress, data: Vec<u8>) {
        if self.tx.try_send((addr, data)).is_err() {
            debug!(%addr, "udp send queue full, dropping datagram");
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddress> {
        let addr = self.socket.local_addr()?;
        SocketAddress::try_from(addr)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "non-ipv4 local addr"))
    }
}
