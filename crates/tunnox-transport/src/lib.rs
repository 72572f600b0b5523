//! Uniform protocol adapter interface (spec §4.6): `listen`, `dial`,
//! `accept_loop`, `close`. Each concrete adapter (`tunnox-transport-tcp`,
//! `-websocket`, `-udp`, `-quic`) normalizes its accepted byte pipe to a
//! boxed [`TransportStream`] and hands it to a [`ConnectionHandler`], which
//! is how the session manager (C7) learns about new connections regardless
//! of which protocol carried them.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use tunnox_lifecycle::Scope;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("transport already closed")]
    AlreadyClosed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Any full-duplex byte pipe an adapter can produce. Blanket-implemented
/// for every type that is already `AsyncRead + AsyncWrite`.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

pub type BoxedStream = Box<dyn TransportStream>;

/// How often the accept loop polls for new connections before re-checking
/// scope cancellation. Keeping this small is what gives the ≤100ms
/// cancellation-latency guarantee from spec §4.6.
pub const ACCEPT_POLL_INTERVAL_MS: u64 = 50;

/// Notified once per accepted connection. The session manager implements
/// this to register new control connections (spec §4.7).
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn accept_connection(&self, stream: BoxedStream, remote_addr: SocketAddr);
}

/// A protocol adapter: TCP, WebSocket, UDP (pseudo-stream) or QUIC.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Binds a listening socket at `addr`. Must be called before
    /// `accept_loop`.
    async fn listen(&self, addr: SocketAddr) -> TransportResult<()>;

    /// Opens an outbound connection to `addr`.
    async fn dial(&self, addr: SocketAddr) -> TransportResult<BoxedStream>;

    /// Runs until `scope` is cancelled or `close()` is called, spawning one
    /// task per accepted connection that calls
    /// `handler.accept_connection(...)`.
    async fn accept_loop(&self, scope: Scope, handler: Arc<dyn ConnectionHandler>) -> TransportResult<()>;

    /// Tears down the listening socket. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    fn name(&self) -> &'static str;
}
