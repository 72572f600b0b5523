//! UDP pseudo-stream adapter (spec §4.6, §6): one shared `UdpSocket` is
//! demultiplexed by peer `SocketAddr` into per-peer byte pipes. Each peer is
//! treated as a new logical connection the first time a datagram arrives
//! from it (SPEC_FULL.md §4 supplement).
//!
//! Datagram boundaries are not preserved as message boundaries on the
//! stream: a peer is expected to send exactly one frame per datagram (the
//! frame codec's own length prefix makes this safe even if that's not the
//! case, at the cost of extra round trips if a frame spans datagrams).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use tunnox_lifecycle::Scope;
use tunnox_transport::{
    ConnectionHandler, TransportAdapter, TransportError, TransportResult, ACCEPT_POLL_INTERVAL_MS,
};

const BUFFER_SIZE: usize = 64 * 1024;
const DATAGRAM_MAX: usize = 64 * 1024;

pub struct UdpAdapter {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peers: DashMap<SocketAddr, Arc<Mutex<WriteHalf<DuplexStream>>>>,
}

impl UdpAdapter {
    pub fn new() -> Self {
        Self {
            socket: RwLock::new(None),
            peers: DashMap::new(),
        }
    }
}

impl Default for UdpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for UdpAdapter {
    async fn listen(&self, addr: SocketAddr) -> TransportResult<()> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(addr)
            } else {
                TransportError::Io(e)
            }
        })?;
        *self.socket.write().await = Some(Arc::new(socket));
        Ok(())
    }

    async fn dial(&self, addr: SocketAddr) -> TransportResult<tunnox_transport::BoxedStream> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        let socket = Arc::new(socket);

        let (near, far) = tokio::io::duplex(BUFFER_SIZE);
        let (mut far_read, mut far_write) = tokio::io::split(far);

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_MAX];
            loop {
                match recv_socket.recv(&mut buf).await {
                    Ok(n) if n > 0 => {
                        if far_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_MAX];
            loop {
                match far_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.send(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::new(near))
    }

    async fn accept_loop(
        &self,
        scope: Scope,
        handler: Arc<dyn ConnectionHandler>,
    ) -> TransportResult<()> {
        let mut buf = vec![0u8; DATAGRAM_MAX];
        loop {
            if scope.is_closed() {
                return Ok(());
            }

            let socket = {
                let guard = self.socket.read().await;
                guard.clone().ok_or(TransportError::AlreadyClosed)?
            };

            match timeout(Duration::from_millis(ACCEPT_POLL_INTERVAL_MS), socket.recv_from(&mut buf)).await {
                Ok(Ok((n, peer_addr))) => {
                    self.dispatch(peer_addr, &buf[..n], &socket, &handler).await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "udp recv_from failed");
                }
                Err(_elapsed) => {}
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        *self.socket.write().await = None;
        self.peers.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

impl UdpAdapter {
    async fn dispatch(
        &self,
        peer_addr: SocketAddr,
        payload: &[u8],
        socket: &Arc<UdpSocket>,
        handler: &Arc<dyn ConnectionHandler>,
    ) {
        if let Some(writer) = self.peers.get(&peer_addr) {
            let writer = writer.clone();
            let mut guard = writer.lock().await;
            if guard.write_all(payload).await.is_err() {
                drop(guard);
                self.peers.remove(&peer_addr);
            }
            return;
        }

        debug!(%peer_addr, "udp pseudo-stream: new peer");
        let (near, far) = tokio::io::duplex(BUFFER_SIZE);
        let (mut far_read, mut far_write) = tokio::io::split(far);

        if far_write.write_all(payload).await.is_err() {
            return;
        }
        self.peers.insert(peer_addr, Arc::new(Mutex::new(far_write)));

        let send_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_MAX];
            loop {
                match far_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if send_socket.send_to(&buf[..n], peer_addr).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let handler = handler.clone();
        tokio::spawn(async move {
            handler.accept_connection(Box::new(near), peer_addr).await;
        });
    }
}
