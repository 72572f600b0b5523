//! A single control connection and its state machine (spec §4.7, §3 data
//! model entry for **Control connection**).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock as StdRwLock;

use chrono::{DateTime, Utc};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use tunnox_lifecycle::Scope;
use tunnox_proto::{CommandPacket, TransferPacket};
use tunnox_stream::{PacketWriter, StreamError};
use tunnox_transport::BoxedStream;

pub type BoxedReader = ReadHalf<BoxedStream>;
pub type BoxedWriter = WriteHalf<BoxedStream>;

/// ```text
///            first JsonCommand with valid credentials
///  new ──────────────────────────────────────────────▶ authenticated
///    │                                                      │
///    │ auth failure / IO error / timeout                    │ same
///    ▼                                                      ▼
///  closing ───────────────────────────────────────────▶ closed
/// ```
/// Transitions are monotonic toward `Closed`; see spec §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Authenticated,
    Closing,
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::New => 0,
            ConnectionState::Authenticated => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }
}

/// Why a connection was closed. Carried through to the scope's close log
/// line and (for `HeartbeatTimeout`) used by spec E4's acceptance test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    HeartbeatTimeout,
    ProtocolError,
    Superseded,
    AuthFailure,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection {0} not found")]
    ConnectionNotFound(i64),
    #[error("client {0} not found or offline")]
    ClientNotFound(u64),
    #[error("client {0} is blocked")]
    ClientBlocked(u64),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Everything the session manager tracks for one accepted byte pipe.
/// Exclusively owned by the session manager per spec §3 ("the Session
/// exclusively owns its Control connection's stream"); the tunnel manager
/// only ever sees an `Arc<ControlConnection>` by id, never the stream
/// itself, until a raw-mode handoff explicitly moves ownership of the
/// reader/writer out.
pub struct ControlConnection {
    connection_id: i64,
    remote_addr: SocketAddr,
    client_id: AtomicI64,
    state: StdRwLock<ConnectionState>,
    last_heartbeat_at: StdRwLock<DateTime<Utc>>,
    writer: AsyncMutex<Option<PacketWriter<BoxedWriter>>>,
    pub scope: Scope,
}

const NO_CLIENT: i64 = -1;

impl ControlConnection {
    pub fn new(
        connection_id: i64,
        remote_addr: SocketAddr,
        writer: PacketWriter<BoxedWriter>,
        scope: Scope,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            client_id: AtomicI64::new(NO_CLIENT),
            state: StdRwLock::new(ConnectionState::New),
            last_heartbeat_at: StdRwLock::new(Utc::now()),
            writer: AsyncMutex::new(Some(writer)),
            scope,
        }
    }

    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn client_id(&self) -> Option<u64> {
        let v = self.client_id.load(Ordering::SeqCst);
        (v != NO_CLIENT).then_some(v as u64)
    }

    pub fn set_client_id(&self, client_id: u64) {
        self.client_id.store(client_id as i64, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    /// Moves the state machine forward. A transition to a lower rank is a
    /// no-op with a warning — state only moves toward `Closed`.
    pub fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().unwrap();
        if next.rank() < state.rank() {
            warn!(
                connection_id = self.connection_id,
                from = ?*state,
                to = ?next,
                "ignoring backward connection state transition"
            );
            return;
        }
        *state = next;
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        *self.last_heartbeat_at.read().unwrap()
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat_at.write().unwrap() = Utc::now();
    }

    pub fn is_stale(&self, timeout: chrono::Duration) -> bool {
        Utc::now() - self.last_heartbeat_at() > timeout
    }

    /// Writes one packet on the shared writer half. `None` if the writer
    /// has already been taken for a raw-mode handoff (spec §4.11) or the
    /// connection closed concurrently.
    pub async fn send_packet(&self, packet: &TransferPacket) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                writer.write_packet(packet, true, None).await?;
                Ok(())
            }
            None => Err(SessionError::ConnectionNotFound(self.connection_id)),
        }
    }

    pub async fn send_command(&self, command: CommandPacket) -> Result<(), SessionError> {
        self.send_packet(&TransferPacket::Command(command)).await
    }

    /// Takes the writer half out for a raw-mode handoff (spec §4.11: "the
    /// session yields its raw byte pipe"). Subsequent `send_packet` calls
    /// fail — by the time this is called, the read loop has already ended,
    /// so there is nobody left expecting a framed reply on this connection.
    pub async fn take_writer(&self) -> Option<PacketWriter<BoxedWriter>> {
        self.writer.lock().await.take()
    }

    /// Idempotent close: marks `Closing` then drives the scope closed,
    /// which runs the session manager's deregistration cleanup (see
    /// `SessionManager::accept_connection`).
    pub async fn close(&self, reason: CloseReason) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);
        tracing::info!(connection_id = self.connection_id, ?reason, "closing control connection");
        self.scope.close().await;
        self.set_state(ConnectionState::Closed);
    }
}
