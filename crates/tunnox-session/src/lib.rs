//! Session manager (spec §4.7): holds `client_id -> control_connection` and
//! `connection_id -> control_connection`, runs each connection's read loop
//! and state machine, enforces exactly-one-online-connection-per-client,
//! and sweeps idle connections on a heartbeat timeout.
//!
//! `TunnelOpenRequest`/`TunnelOpenResponse` frames are the one command
//! family the session handles synchronously instead of publishing to the
//! event bus (spec §4.7: "forward to tunnel manager synchronously; the
//! session yields its raw byte pipe afterward") — everything else becomes a
//! `CommandReceivedEvent` for the command service (C8) to pick up off the
//! read loop's critical path.

pub mod connection;

pub use connection::{BoxedReader, BoxedWriter, CloseReason, ConnectionState, ControlConnection, SessionError};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use tunnox_events::{Event, EventBus, EventHandler, EventError, EventKind};
use tunnox_ids::IdManager;
use tunnox_lifecycle::Scope;
use tunnox_proto::{CommandPacket, CommandType, ResponseBody, TransferPacket};
use tunnox_stream::{PacketReader, PacketStream, Transformer};
use tunnox_transport::{BoxedStream, ConnectionHandler};

/// Default per spec §4.7 ("defaults: 30 s / 90 s").
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceivedPayload {
    pub connection_id: i64,
    pub command: CommandPacket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCompletedPayload {
    pub connection_id: i64,
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub response_body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionEstablishedPayload {
    connection_id: i64,
    remote_addr: String,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionClosedPayload {
    connection_id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct HeartbeatPayload {
    connection_id: i64,
}

/// What the session manager calls into, synchronously, for the two
/// tunnel-open command types (spec §4.11). Implemented by the tunnel
/// manager (C11); kept as a trait here so `tunnox-session` never depends on
/// `tunnox-tunnel`.
#[async_trait]
pub trait TunnelOpenSink: Send + Sync {
    /// Validates and registers a source-side `TunnelOpenRequest`. Returns
    /// the ack to send back to the caller; the session only switches this
    /// connection to raw mode and calls `attach_source_raw` if the ack is
    /// a success.
    async fn prepare_source_open(&self, conn: &Arc<ControlConnection>, command: &CommandPacket) -> ResponseBody;

    /// Same, for a target-side `TunnelOpenResponse`.
    async fn prepare_target_open(&self, conn: &Arc<ControlConnection>, command: &CommandPacket) -> ResponseBody;

    /// Called once the ack has been written and the read loop has ended;
    /// `reader`/`writer` are now exclusively owned by the tunnel manager.
    async fn attach_source_raw(&self, command: &CommandPacket, reader: BoxedReader, writer: BoxedWriter);

    async fn attach_target_raw(&self, command: &CommandPacket, reader: BoxedReader, writer: BoxedWriter);
}

fn is_tunnel_open(command_type: &CommandType) -> bool {
    matches!(command_type, CommandType::TunnelOpenRequest | CommandType::TunnelOpenResponse)
}

fn response_command(original: &CommandPacket, response: ResponseBody) -> CommandPacket {
    CommandPacket::new(
        CommandType::Response,
        original.command_id.clone(),
        original.token.clone(),
        original.receiver_id,
        original.sender_id,
        serde_json::to_value(response).unwrap_or(Value::Null),
    )
}

pub struct SessionManager {
    connections: RwLock<HashMap<i64, Arc<ControlConnection>>>,
    clients: RwLock<HashMap<u64, Arc<ControlConnection>>>,
    bus: Arc<EventBus>,
    ids: IdManager,
    scope: Scope,
    heartbeat_interval: Duration,
    heartbeat_timeout: chrono::Duration,
    tunnel_sink: AsyncMutex<Option<Arc<dyn TunnelOpenSink>>>,
}

impl SessionManager {
    pub fn new(bus: Arc<EventBus>, ids: IdManager, scope: Scope) -> Arc<Self> {
        Self::with_heartbeat(bus, ids, scope, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn with_heartbeat(
        bus: Arc<EventBus>,
        ids: IdManager,
        scope: Scope,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            bus: bus.clone(),
            ids,
            scope,
            heartbeat_interval,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout).unwrap_or(chrono::Duration::seconds(90)),
            tunnel_sink: AsyncMutex::new(None),
        });

        bus.subscribe(
            EventKind::CommandCompleted,
            Arc::new(ResponseRouter { manager: manager.clone() }),
        );
        manager.clone().spawn_heartbeat_sweep();
        manager
    }

    pub async fn set_tunnel_sink(&self, sink: Arc<dyn TunnelOpenSink>) {
        *self.tunnel_sink.lock().await = Some(sink);
    }

    pub async fn connection(&self, connection_id: i64) -> Option<Arc<ControlConnection>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Snapshot of all currently tracked connections, keyed by connection
    /// id. Used by callers (and tests) that need to enumerate connections
    /// without holding the manager's internal lock.
    pub async fn connections_snapshot(&self) -> HashMap<i64, Arc<ControlConnection>> {
        self.connections.read().await.clone()
    }

    pub async fn connection_for_client(&self, client_id: u64) -> Option<Arc<ControlConnection>> {
        self.clients.read().await.get(&client_id).cloned()
    }

    /// Registers `client_id` against `connection_id`'s connection (spec
    /// §4.8 `Authenticate` handler calls this after validating
    /// credentials). Enforces "exactly one online connection per client":
    /// a prior connection for the same client is scheduled for graceful
    /// close (spec §8 property 8 — within one heartbeat interval, never
    /// reused).
    pub async fn authenticate(&self, connection_id: i64, client_id: u64) -> Result<(), SessionError> {
        let conn = self
            .connection(connection_id)
            .await
            .ok_or(SessionError::ConnectionNotFound(connection_id))?;

        conn.set_client_id(client_id);
        conn.set_state(ConnectionState::Authenticated);

        let previous = self.clients.write().await.insert(client_id, conn.clone());

        if let Some(prev) = previous {
            if prev.connection_id() != connection_id {
                info!(
                    client_id,
                    old_connection = prev.connection_id(),
                    new_connection = connection_id,
                    "superseding prior online connection for this client"
                );
                tokio::spawn(async move { prev.close(CloseReason::Superseded).await });
            }
        }
        Ok(())
    }

    async fn deregister(&self, conn: &Arc<ControlConnection>) {
        self.connections.write().await.remove(&conn.connection_id());
        if let Some(client_id) = conn.client_id() {
            let mut clients = self.clients.write().await;
            if clients.get(&client_id).map(|c| c.connection_id()) == Some(conn.connection_id()) {
                clients.remove(&client_id);
            }
        }
        self.bus.publish(
            Event::with_payload(
                EventKind::ConnectionClosed,
                "session",
                &ConnectionClosedPayload { connection_id: conn.connection_id() },
            )
            .expect("payload serializes"),
        );
    }

    async fn route_response(&self, payload: CommandCompletedPayload) -> Result<(), SessionError> {
        let Some(conn) = self.connection(payload.connection_id).await else {
            // The connection closed before its response was ready; the
            // client is expected to re-request on reconnect (spec §4.9/§7).
            return Ok(());
        };
        let response = ResponseBody {
            success: payload.success,
            response_body: payload.response_body,
            error: payload.error,
        };
        let command = CommandPacket::new(
            CommandType::Response,
            payload.command_id,
            String::new(),
            0,
            conn.client_id().unwrap_or(0),
            serde_json::to_value(response).unwrap_or(Value::Null),
        );
        conn.send_command(command).await
    }

    /// Entry point from the transport layer (spec §4.6
    /// `accept_connection`). Wraps the accepted byte pipe in a packet
    /// stream, registers a new `ControlConnection` and spawns its read
    /// loop.
    pub async fn handle_accept(self: &Arc<Self>, stream: BoxedStream, remote_addr: SocketAddr) {
        let connection_id = match self.ids.next_connection_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "failed to allocate a connection id; dropping connection");
                return;
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let packet_stream = PacketStream::new(read_half, write_half, Transformer::identity());
        let (reader, writer) = packet_stream.split();

        let conn_scope = self.scope.child(format!("conn-{connection_id}"), || async { Ok(()) });
        let conn = Arc::new(ControlConnection::new(connection_id, remote_addr, writer, conn_scope.clone()));

        self.connections.write().await.insert(connection_id, conn.clone());

        let manager = self.clone();
        let cleanup_conn = conn.clone();
        conn_scope.add_cleanup(move || async move {
            manager.deregister(&cleanup_conn).await;
            Ok(())
        });

        debug!(connection_id, %remote_addr, "control connection accepted");
        self.bus.publish(
            Event::with_payload(
                EventKind::ConnectionEstablished,
                "session",
                &ConnectionEstablishedPayload { connection_id, remote_addr: remote_addr.to_string() },
            )
            .expect("payload serializes"),
        );

        let manager = self.clone();
        tokio::spawn(async move { manager.read_loop(conn, reader).await });
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<ControlConnection>, reader: PacketReader<BoxedReader>) {
        let mut reader = reader;
        loop {
            let read_result = tokio::select! {
                _ = conn.scope.cancelled() => return,
                r = reader.read_packet() => r,
            };

            match read_result {
                Ok((TransferPacket::Heartbeat, _)) => {
                    conn.touch_heartbeat();
                    self.bus.publish(
                        Event::with_payload(
                            EventKind::Heartbeat,
                            "session",
                            &HeartbeatPayload { connection_id: conn.connection_id() },
                        )
                        .expect("payload serializes"),
                    );
                }
                Ok((TransferPacket::Command(command), _)) if is_tunnel_open(&command.command_type) => {
                    match self.handle_tunnel_open(&conn, &command, reader).await {
                        Some(returned) => reader = returned,
                        None => return,
                    }
                }
                Ok((TransferPacket::Command(command), _)) => {
                    self.bus.publish(
                        Event::with_payload(
                            EventKind::CommandReceived,
                            "session",
                            &CommandReceivedPayload { connection_id: conn.connection_id(), command },
                        )
                        .expect("payload serializes"),
                    );
                }
                Err(tunnox_stream::StreamError::Eof) => {
                    conn.close(CloseReason::Graceful).await;
                    return;
                }
                Err(e) => {
                    warn!(connection_id = conn.connection_id(), error = %e, "control connection read error");
                    conn.close(CloseReason::ProtocolError).await;
                    return;
                }
            }
        }
    }

    /// Returns `Some(reader)` to keep reading framed commands (the open
    /// request was rejected), or `None` once the connection has switched
    /// to raw tunnel mode and the read loop must stop.
    async fn handle_tunnel_open(
        &self,
        conn: &Arc<ControlConnection>,
        command: &CommandPacket,
        reader: PacketReader<BoxedReader>,
    ) -> Option<PacketReader<BoxedReader>> {
        let sink = self.tunnel_sink.lock().await.clone();
        let Some(sink) = sink else {
            warn!("tunnel open command received before a tunnel sink was installed");
            let _ = conn
                .send_command(response_command(command, ResponseBody::failed("tunnel manager unavailable")))
                .await;
            return Some(reader);
        };

        let is_source = matches!(command.command_type, CommandType::TunnelOpenRequest);
        let response = if is_source {
            sink.prepare_source_open(conn, command).await
        } else {
            sink.prepare_target_open(conn, command).await
        };

        let success = response.success;
        let _ = conn.send_command(response_command(command, response)).await;
        if !success {
            return Some(reader);
        }

        let Some(writer) = conn.take_writer().await else {
            return None;
        };
        let raw_reader = reader.into_inner();
        let raw_writer = writer.into_inner();
        if is_source {
            sink.attach_source_raw(command, raw_reader, raw_writer).await;
        } else {
            sink.attach_target_raw(command, raw_reader, raw_writer).await;
        }
        None
    }

    fn spawn_heartbeat_sweep(self: Arc<Self>) {
        let sweep_scope = self.scope.child("heartbeat-sweep", || async { Ok(()) });
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = sweep_scope.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let stale: Vec<Arc<ControlConnection>> = {
                    let connections = self.connections.read().await;
                    connections
                        .values()
                        .filter(|c| c.state() == ConnectionState::Authenticated && c.is_stale(self.heartbeat_timeout))
                        .cloned()
                        .collect()
                };

                debug!(considered_stale = stale.len(), "heartbeat sweep pass");
                for conn in stale {
                    conn.close(CloseReason::HeartbeatTimeout).await;
                }
            }
        });
    }
}

/// Adapts a [`SessionManager`] to the transport layer's [`ConnectionHandler`]
/// seam — a thin delegating wrapper since `ConnectionHandler` can't be
/// implemented directly on `Arc<SessionManager>` (both are foreign to this
/// crate).
pub struct SessionHandler(pub Arc<SessionManager>);

#[async_trait]
impl ConnectionHandler for SessionHandler {
    async fn accept_connection(&self, stream: BoxedStream, remote_addr: SocketAddr) {
        self.0.handle_accept(stream, remote_addr).await;
    }
}

struct ResponseRouter {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl EventHandler for ResponseRouter {
    async fn handle(&self, event: Event) -> Result<(), EventError> {
        if event.kind != EventKind::CommandCompleted {
            return Ok(());
        }
        let payload: CommandCompletedPayload =
            serde_json::from_value(event.payload).map_err(|e| EventError::Handler(e.to_string()))?;
        self.manager
            .route_response(payload)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tunnox_proto::{build_command, build_transfer};
    use tunnox_store::MemoryKvStore;

    fn ids() -> IdManager {
        IdManager::new(Arc::new(MemoryKvStore::new()))
    }

    async fn duplex_boxed_pair() -> (BoxedStream, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(8192);
        (Box::new(a), b)
    }

    #[tokio::test]
    async fn heartbeat_frame_updates_last_heartbeat_and_publishes_event() {
        let bus = EventBus::new();
        let manager = SessionManager::new(bus.clone(), ids(), Scope::new("root"));

        let (boxed, mut peer) = duplex_boxed_pair().await;
        manager.handle_accept(boxed, "127.0.0.1:1111".parse().unwrap()).await;

        tunnox_proto::build_heartbeat(&mut peer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let connections = manager.connections.read().await;
        assert_eq!(connections.len(), 1);
        let conn = connections.values().next().unwrap();
        assert!(Utc::now().signed_duration_since(conn.last_heartbeat_at()) < chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn second_authentication_supersedes_the_first_connection() {
        let bus = EventBus::new();
        let manager = SessionManager::new(bus, ids(), Scope::new("root"));

        let (boxed_a, _peer_a) = duplex_boxed_pair().await;
        manager.handle_accept(boxed_a, "127.0.0.1:1".parse().unwrap()).await;
        let (boxed_b, _peer_b) = duplex_boxed_pair().await;
        manager.handle_accept(boxed_b, "127.0.0.1:2".parse().unwrap()).await;

        let ids: Vec<i64> = manager.connections.read().await.keys().cloned().collect();
        assert_eq!(ids.len(), 2);

        manager.authenticate(ids[0], 10000001).await.unwrap();
        manager.authenticate(ids[1], 10000001).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let current = manager.connection_for_client(10000001).await.unwrap();
        assert_eq!(current.connection_id(), ids[1]);
    }

    #[tokio::test]
    async fn non_tunnel_command_is_published_as_command_received() {
        let bus = EventBus::new();
        let manager = SessionManager::new(bus.clone(), ids(), Scope::new("root"));

        struct Recorder(tokio::sync::Mutex<Vec<CommandReceivedPayload>>);
        #[async_trait]
        impl EventHandler for Recorder {
            async fn handle(&self, event: Event) -> Result<(), EventError> {
                let payload: CommandReceivedPayload = serde_json::from_value(event.payload).unwrap();
                self.0.lock().await.push(payload);
                Ok(())
            }
        }
        let recorder = Arc::new(Recorder(tokio::sync::Mutex::new(Vec::new())));
        bus.subscribe(EventKind::CommandReceived, recorder.clone());

        let (boxed, mut peer) = duplex_boxed_pair().await;
        manager.handle_accept(boxed, "127.0.0.1:3".parse().unwrap()).await;

        let command = CommandPacket::new(
            CommandType::Heartbeat,
            "cmd-1",
            "tok",
            1,
            2,
            serde_json::json!({}),
        );
        build_command(&mut peer, &command).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let seen = recorder.0.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].command.command_id, "cmd-1");
    }

    #[tokio::test]
    async fn response_router_writes_a_response_frame_on_the_originating_connection() {
        let bus = EventBus::new();
        let manager = SessionManager::new(bus.clone(), ids(), Scope::new("root"));

        let (boxed, mut peer) = duplex_boxed_pair().await;
        manager.handle_accept(boxed, "127.0.0.1:4".parse().unwrap()).await;
        let connection_id = *manager.connections.read().await.keys().next().unwrap();

        bus.publish(
            Event::with_payload(
                EventKind::CommandCompleted,
                "test",
                &CommandCompletedPayload {
                    connection_id,
                    command_id: "cmd-9".to_string(),
                    success: true,
                    response_body: serde_json::json!({"ok": true}),
                    error: None,
                    processing_time_ms: 1,
                },
            )
            .unwrap(),
        );

        let transfer = tokio::time::timeout(Duration::from_millis(200), build_transfer(&mut peer))
            .await
            .unwrap()
            .unwrap();
        match transfer {
            tunnox_proto::TransferPacket::Command(c) => {
                assert_eq!(c.command_id, "cmd-9");
                assert_eq!(c.command_type, CommandType::Response);
            }
            tunnox_proto::TransferPacket::Heartbeat => panic!("expected a response command"),
        }
    }

    #[tokio::test]
    async fn rejected_tunnel_open_keeps_the_connection_in_framed_mode() {
        struct RejectingSink;
        #[async_trait]
        impl TunnelOpenSink for RejectingSink {
            async fn prepare_source_open(&self, _c: &Arc<ControlConnection>, _cmd: &CommandPacket) -> ResponseBody {
                ResponseBody::failed("mapping not found")
            }
            async fn prepare_target_open(&self, _c: &Arc<ControlConnection>, _cmd: &CommandPacket) -> ResponseBody {
                ResponseBody::failed("unreachable")
            }
            async fn attach_source_raw(&self, _cmd: &CommandPacket, _r: BoxedReader, _w: BoxedWriter) {
                panic!("should not attach on rejection");
            }
            async fn attach_target_raw(&self, _cmd: &CommandPacket, _r: BoxedReader, _w: BoxedWriter) {
                panic!("should not attach on rejection");
            }
        }

        let bus = EventBus::new();
        let manager = SessionManager::new(bus, ids(), Scope::new("root"));
        manager.set_tunnel_sink(Arc::new(RejectingSink)).await;

        let (boxed, mut peer) = duplex_boxed_pair().await;
        manager.handle_accept(boxed, "127.0.0.1:5".parse().unwrap()).await;

        let body = tunnox_proto::TunnelOpenRequestBody {
            tunnel_id: "t1".into(),
            mapping_id: "m1".into(),
            secret_key: "k".into(),
            protocol: tunnox_store::Protocol::Tcp,
            target_host: "127.0.0.1".into(),
            target_port: 80,
            enable_compression: false,
            compression_level: 0,
            enable_encryption: false,
            encryption_method: String::new(),
            encryption_key: String::new(),
        };
        let command = CommandPacket::new(
            CommandType::TunnelOpenRequest,
            "cmd-open",
            "tok",
            1,
            2,
            serde_json::to_value(&body).unwrap(),
        );
        build_command(&mut peer, &command).await.unwrap();

        let transfer = tokio::time::timeout(Duration::from_millis(200), build_transfer(&mut peer))
            .await
            .unwrap()
            .unwrap();
        match transfer {
            tunnox_proto::TransferPacket::Command(c) => assert_eq!(c.command_type, CommandType::Response),
            tunnox_proto::TransferPacket::Heartbeat => panic!("expected response"),
        }

        // The connection should still be in framed mode: another heartbeat
        // must be observable as a heartbeat event, not an I/O error.
        tunnox_proto::build_heartbeat(&mut peer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.connections.read().await.len(), 1);

        let _ = AsyncWriteExt::flush(&mut peer).await;
        let _ = AsyncReadExt::read(&mut peer, &mut [0u8; 0]).await;
    }
}
