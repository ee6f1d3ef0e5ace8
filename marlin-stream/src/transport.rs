#![forbid(unsafe_code)]

//! Async shell around [`Connection`]. One tokio task owns each
//! connection's state and multiplexes its datagrams, application
//! commands and timers; everything the upper layer needs arrives as
//! [`TransportEvent`]s on a single channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use marlin_core::{Buffer, SocketAddress};
use marlin_crypto::StaticKeypair;
use marlin_transport::{DatagramHandler, UdpFiber};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{CloseReason, ConnEvent, Connection};
use crate::manager::TransportManager;
use crate::packet::{peek_type, PacketType};
use crate::{Error, Result};

/// Events surfaced to the layer above the stream transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A transport came into existence (inbound dial or local `dial`).
    DidCreateTransport(StreamTransport),
    /// The handshake completed; the transport is usable.
    DidDial(StreamTransport),
    DidRecv {
        transport: StreamTransport,
        stream_id: u16,
        data: Bytes,
    },
    DidSend {
        transport: StreamTransport,
        stream_id: u16,
    },
    DidRecvSkipStream {
        transport: StreamTransport,
        stream_id: u16,
    },
    DidRecvFlushStream {
        transport: StreamTransport,
        stream_id: u16,
        offset: u64,
        old_offset: u64,
    },
    DidRecvFlushConf {
        transport: StreamTransport,
        stream_id: u16,
    },
    DidClose {
        transport: StreamTransport,
        reason: CloseReason,
    },
}

enum Cmd {
    Send { data: Bytes, stream_id: u16 },
    FlushStream(u16),
    SkipStream(u16),
    RequestFlush(u16),
    Close,
}

struct Shared {
    src_addr: SocketAddress,
    dst_addr: SocketAddress,
    is_dialer: bool,
    rtt_micros: AtomicU64,
    closed: AtomicBool,
    remote_pk: RwLock<Option<[u8; 32]>>,
}

/// Cloneable handle to one peer connection. Operations after close fail
/// immediately with [`Error::Closed`].
#[derive(Clone)]
pub struct StreamTransport {
    cmd_tx: mpsc::Sender<Cmd>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("src", &self.shared.src_addr)
            .field("dst", &self.shared.dst_addr)
            .finish()
    }
}

impl StreamTransport {
    pub fn src_addr(&self) -> SocketAddress {
        self.shared.src_addr
    }

    pub fn dst_addr(&self) -> SocketAddress {
        self.shared.dst_addr
    }

    pub fn is_dialer(&self) -> bool {
        self.shared.is_dialer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Smoothed RTT as last observed by the connection task.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.shared.rtt_micros.load(Ordering::Relaxed))
    }

    /// Peer static key, known once the handshake completes.
    pub fn remote_static_pk(&self) -> Option<[u8; 32]> {
        *self.shared.remote_pk.read()
    }

    fn command(&self, cmd: Cmd) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.cmd_tx
            .try_send(cmd)
            .map_err(|_| Error::protocol("transport command queue full"))
    }

    /// Queue `data` for ordered delivery on `stream_id`.
    pub fn send(&self, data: Bytes, stream_id: u16) -> Result<()> {
        self.command(Cmd::Send { data, stream_id })
    }

    pub fn flush_stream(&self, stream_id: u16) -> Result<()> {
        self.command(Cmd::FlushStream(stream_id))
    }

    pub fn skip_stream(&self, stream_id: u16) -> Result<()> {
        self.command(Cmd::SkipStream(stream_id))
    }

    pub fn request_flush(&self, stream_id: u16) -> Result<()> {
        self.command(Cmd::RequestFlush(stream_id))
    }

    /// Close the connection. Idempotent; takes effect for callers
    /// immediately, cleanup is deferred to the connection task.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cmd_tx.try_send(Cmd::Close);
    }
}

struct ConnHandle {
    datagram_tx: mpsc::Sender<Buffer>,
    transport: StreamTransport,
    task: tokio::task::JoinHandle<()>,
}

struct Inner {
    local_addr: SocketAddress,
    keypair: StaticKeypair,
    udp: UdpFiber,
    conns: Mutex<TransportManager<ConnHandle>>,
    event_tx: mpsc::Sender<TransportEvent>,
}

/// Binds the UDP fiber and maps peers to connections, creating them on
/// inbound DIALs and local dials.
#[derive(Clone)]
pub struct StreamTransportFactory {
    inner: Arc<Inner>,
}

impl StreamTransportFactory {
    /// Bind on `addr`; events for every transport arrive on the returned
    /// receiver once [`listen`](Self::listen) is called.
    pub async fn bind(
        addr: SocketAddress,
        keypair: StaticKeypair,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let udp = UdpFiber::bind(addr).await?;
        let local_addr = udp.local_addr()?;
        let (event_tx, event_rx) = mpsc::channel(1024);
        let inner = Arc::new(Inner {
            local_addr,
            keypair,
            udp,
            conns: Mutex::new(TransportManager::new()),
            event_tx,
        });
        Ok((Self { inner }, event_rx))
    }

    /// Start accepting inbound connections.
    pub fn listen(&self) {
        self.inner.udp.listen(Arc::new(FactoryHandler {
            inner: self.inner.clone(),
        }));
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.inner.local_addr
    }

    /// Open (or return the existing) transport to `addr`. The peer's
    /// static key must be known.
    pub fn dial(&self, addr: SocketAddress, remote_static_pk: [u8; 32]) -> StreamTransport {
        let mut conns = self.inner.conns.lock();
        let (handle, created) = conns.get_or_create(addr, || {
            spawn_connection(
                &self.inner,
                ConnSpawn::Dial {
                    remote_static_pk,
                },
                addr,
            )
        });
        let transport = handle.transport.clone();
        drop(conns);
        if created {
            let _ = self
                .inner
                .event_tx
                .try_send(TransportEvent::DidCreateTransport(transport.clone()));
        }
        transport
    }

    pub fn get_transport(&self, addr: &SocketAddress) -> Option<StreamTransport> {
        self.inner.conns.lock().get(addr).map(|h| h.transport.clone())
    }

    pub fn transport_count(&self) -> usize {
        self.inner.conns.lock().len()
    }

    /// Tear a transport down. Synchronous from the caller's view: the
    /// handle is closed before this returns, the task is aborted.
    pub fn erase(&self, addr: &SocketAddress) {
        if let Some(handle) = self.inner.conns.lock().erase(addr) {
            handle.transport.shared.closed.store(true, Ordering::Release);
            handle.task.abort();
        }
    }
}

struct FactoryHandler {
    inner: Arc<Inner>,
}

#[async_trait]
impl DatagramHandler for FactoryHandler {
    async fn did_recv(&self, src: SocketAddress, datagram: Buffer) {
        let (tx, created_transport) = {
            let mut conns = self.inner.conns.lock();
            if let Some(handle) = conns.get(&src) {
                (handle.datagram_tx.clone(), None)
            } else {
                // Only a DIAL may open a connection.
                if peek_type(&datagram) != Some(PacketType::Dial) {
                    debug!(%src, "dropping datagram for unknown connection");
                    return;
                }
                let (handle, _) =
                    conns.get_or_create(src, || spawn_connection(&self.inner, ConnSpawn::Accept, src));
                (handle.datagram_tx.clone(), Some(handle.transport.clone()))
            }
        };

        if let Some(transport) = created_transport {
            let _ = self
                .inner
                .event_tx
                .send(TransportEvent::DidCreateTransport(transport))
                .await;
        }
        if tx.send(datagram).await.is_err() {
            debug!(%src, "connection task gone, datagram dropped");
        }
    }
}

enum ConnSpawn {
    Dial { remote_static_pk: [u8; 32] },
    Accept,
}

fn spawn_connection(inner: &Arc<Inner>, spawn: ConnSpawn, dst_addr: SocketAddress) -> ConnHandle {
    let (datagram_tx, datagram_rx) = mpsc::channel(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel(1024);

    let is_dialer = matches!(spawn, ConnSpawn::Dial { .. });
    let shared = Arc::new(Shared {
        src_addr: inner.local_addr,
        dst_addr,
        is_dialer,
        rtt_micros: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        remote_pk: RwLock::new(match &spawn {
            ConnSpawn::Dial { remote_static_pk } => Some(*remote_static_pk),
            ConnSpawn::Accept => None,
        }),
    });
    let transport = StreamTransport {
        cmd_tx,
        shared: shared.clone(),
    };

    let conn = match spawn {
        ConnSpawn::Dial { remote_static_pk } => Connection::new_dialer(
            inner.local_addr,
            dst_addr,
            inner.keypair.clone(),
            remote_static_pk,
            Instant::now(),
        ),
        ConnSpawn::Accept => {
            Connection::new_listener(inner.local_addr, dst_addr, inner.keypair.clone())
        }
    };

    let task_inner = inner.clone();
    let task_transport = transport.clone();
    let task = tokio::spawn(run_connection(
        conn,
        datagram_rx,
        cmd_rx,
        task_inner,
        task_transport,
    ));

    ConnHandle {
        datagram_tx,
        transport,
        task,
    }
}

async fn run_connection(
    mut conn: Connection,
    mut datagram_rx: mpsc::Receiver<Buffer>,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    inner: Arc<Inner>,
    transport: StreamTransport,
) {
    let dst_addr = transport.dst_addr();

    loop {
        drain(&mut conn, &inner, &transport).await;
        if conn.is_closed() {
            break;
        }

        let deadline = conn
            .next_timeout()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            datagram = datagram_rx.recv() => match datagram {
                Some(datagram) => conn.handle_datagram(Instant::now(), datagram),
                None => conn.close(CloseReason::Local),
            },
            cmd = cmd_rx.recv() => {
                let now = Instant::now();
                match cmd {
                    Some(Cmd::Send { data, stream_id }) => {
                        if let Err(e) = conn.send(data, stream_id, now) {
                            warn!(%dst_addr, stream_id, "send failed: {e}");
                        }
                    }
                    Some(Cmd::FlushStream(id)) => {
                        let _ = conn.flush_stream(id, now);
                    }
                    Some(Cmd::SkipStream(id)) => {
                        let _ = conn.skip_stream(id, now);
                    }
                    Some(Cmd::RequestFlush(id)) => {
                        let _ = conn.request_flush(id, now);
                    }
                    Some(Cmd::Close) | None => conn.close(CloseReason::Local),
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                conn.on_timeout(Instant::now());
            }
        }
    }

    drain(&mut conn, &inner, &transport).await;
    transport.shared.closed.store(true, Ordering::Release);
    inner.conns.lock().erase(&dst_addr);
}

/// Push queued datagrams to the UDP fiber and queued connection events to
/// the delegate channel.
async fn drain(conn: &mut Connection, inner: &Arc<Inner>, transport: &StreamTransport) {
    while let Some(datagram) = conn.poll_transmit() {
        inner.udp.send(conn.dst_addr, datagram);
    }

    transport
        .shared
        .rtt_micros
        .store(conn.rtt().as_micros() as u64, Ordering::Relaxed);

    while let Some(event) = conn.poll_event() {
        let event = match event {
            ConnEvent::Established => {
                if let Some(pk) = conn.remote_static_pk() {
                    *transport.shared.remote_pk.write() = Some(pk);
                }
                TransportEvent::DidDial(transport.clone())
            }
            ConnEvent::DidRecv { stream_id, data } => TransportEvent::DidRecv {
                transport: transport.clone(),
                stream_id,
                data,
            },
            ConnEvent::DidSend { stream_id } => TransportEvent::DidSend {
                transport: transport.clone(),
                stream_id,
            },
            ConnEvent::DidRecvSkipStream { stream_id } => TransportEvent::DidRecvSkipStream {
                transport: transport.clone(),
                stream_id,
            },
            ConnEvent::DidRecvFlushStream {
                stream_id,
                offset,
                old_offset,
            } => TransportEvent::DidRecvFlushStream {
                transport: transport.clone(),
                stream_id,
                offset,
                old_offset,
            },
            ConnEvent::DidRecvFlushConf { stream_id } => TransportEvent::DidRecvFlushConf {
                transport: transport.clone(),
                stream_id,
            },
            ConnEvent::DidClose { reason } => {
                transport.shared.closed.store(true, Ordering::Release);
                TransportEvent::DidClose {
                    transport: transport.clone(),
                    reason,
                }
            }
        };
        if inner.event_tx.send(event).await.is_err() {
            return;
        }
    }
}
