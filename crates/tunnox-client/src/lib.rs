//! Client-side half of the control/data plane.
//!
//! The server-side crates in this workspace (`tunnox-session`, `-commands`,
//! `-tunnel`) never dial out to a client — this crate is the other end of
//! the same wire protocol they already define (`tunnox-proto`,
//! `tunnox-stream`), written from the client's perspective:
//!
//! - [`Client::connect`] dials the server, sends an `Authenticate` command
//!   (spec §4.8) and keeps the connection alive with a heartbeat loop (spec
//!   §4.7's 30s default).
//! - Every `ConfigSet` push (spec §4.9) replaces the client's local mapping
//!   view; a changed view starts or stops the local listeners the source
//!   half of §4.11 needs.
//! - A `TunnelOpenRequest` arriving on the main connection is the server
//!   asking this client, as the *target* of some mapping, to pair (spec
//!   §4.11 target-side `handle_target_tunnel_open`); see [`target`].
//! - Accepting a connection on a source mapping's local listening port
//!   opens a brand new connection to the server and drives the *source*
//!   side of the same handshake; see [`source`].
//!
//! Each tunnel gets its own dedicated connection to the server — the
//! handshake command is the first (and last) framed thing written on it
//! before both ends switch to raw byte mode (spec §4.7: "the session yields
//! its raw byte pipe afterward"). The single long-lived control connection
//! this crate maintains is reserved for `Authenticate`/`Heartbeat`/
//! `ConfigGet`/`PortMapCreate`/`PortMapRemove` and the `ConfigSet`/
//! `TunnelOpenRequest` pushes the server sends back on it.

pub mod source;
pub mod target;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tunnox_lifecycle::Scope;
use tunnox_proto::{
    AuthenticateBody, CommandPacket, CommandType, ConfigSetBody, ResponseBody, TransferPacket,
};
use tunnox_stream::{
    CompressionKind, EncryptionKind, PacketReader, PacketStream, PacketWriter, StreamError, Transformer,
};
use tunnox_transport::{BoxedStream, TransportAdapter};
use tunnox_transport_tcp::TcpAdapter;
use tunnox_store::{PortMapping, TransformConfig};

type BoxedReader = tokio::io::ReadHalf<BoxedStream>;
type BoxedWriter = tokio::io::WriteHalf<BoxedStream>;

/// Default per spec §4.7 ("defaults: 30 s / 90 s") — the client drives the
/// interval half of that pair; the server's heartbeat sweep enforces the
/// timeout half.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long a request/response command waits for its `Response` frame
/// before giving up. Not named by the spec; chosen well under the server's
/// 90s heartbeat timeout so a hung command fails long before the
/// connection itself would be reaped.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("dial to server failed: {0}")]
    Dial(#[from] tunnox_transport::TransportError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("command timed out waiting for a response")]
    Timeout,
    #[error("the control connection is closed")]
    Closed,
    #[error(transparent)]
    Transform(#[from] tunnox_stream::TransformError),
}

/// Builds the tunnel's transformer from a mapping's transform settings,
/// mirroring `tunnox-tunnel`'s server-side construction (compression then
/// encryption on encode, the reverse on decode).
pub(crate) fn build_transformer(cfg: &TransformConfig) -> Result<Transformer, ClientError> {
    let compression = if cfg.enable_compression {
        CompressionKind::Gzip { level: cfg.compression_level.clamp(1, 9) as u32 }
    } else {
        CompressionKind::None
    };
    let encryption = if cfg.enable_encryption {
        EncryptionKind::new(&cfg.encryption_method, cfg.encryption_key.as_bytes())?
    } else {
        EncryptionKind::None
    };
    Ok(Transformer::new(compression, encryption))
}

/// Everything needed to dial and authenticate against a server node.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// Empty for an anonymous client (spec §3: "user_id (string or empty
    /// for anonymous)" is mirrored by an empty `auth_code` here).
    pub auth_code: String,
    pub secret_key: String,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn anonymous(server_addr: SocketAddr, secret_key: impl Into<String>) -> Self {
        Self {
            server_addr,
            auth_code: String::new(),
            secret_key: secret_key.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// The client's live control connection, plus its source-side listeners and
/// cached mapping view. Constructed by [`Client::connect`]; cloned freely
/// (an `Arc` internally) by anything that needs to send a command or read
/// the current mapping set.
pub struct Client {
    config: ClientConfig,
    client_id: RwLock<Option<u64>>,
    writer: AsyncMutex<Option<PacketWriter<BoxedWriter>>>,
    pending: DashMap<String, oneshot::Sender<ResponseBody>>,
    mappings: RwLock<Vec<PortMapping>>,
    /// One child scope per active source-side listener, keyed by
    /// `source_port` so a `ConfigSet` that drops a mapping can tear down
    /// exactly that listener without disturbing the others.
    listeners: AsyncMutex<HashMap<u16, Scope>>,
    scope: Scope,
}

impl Client {
    /// Dials `config.server_addr`, authenticates, and spawns the read loop
    /// and heartbeat loop. Returns once authentication succeeds.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let scope = Scope::new(format!("tunnox-client-{}", config.server_addr));
        let adapter = TcpAdapter::new();
        let stream = adapter.dial(config.server_addr).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let packet_stream = PacketStream::new(read_half, write_half, Transformer::identity());
        let (reader, writer) = packet_stream.split();

        let client = Arc::new(Self {
            config,
            client_id: RwLock::new(None),
            writer: AsyncMutex::new(Some(writer)),
            pending: DashMap::new(),
            mappings: RwLock::new(Vec::new()),
            listeners: AsyncMutex::new(HashMap::new()),
            scope,
        });

        let read_loop_client = client.clone();
        tokio::spawn(async move { read_loop_client.read_loop(reader).await });

        client.authenticate().await?;
        client.clone().spawn_heartbeat_loop();
        Ok(client)
    }

    pub fn client_id_blocking(&self) -> Option<u64> {
        self.client_id.try_read().ok().and_then(|g| *g)
    }

    pub async fn client_id(&self) -> Option<u64> {
        *self.client_id.read().await
    }

    pub async fn mappings(&self) -> Vec<PortMapping> {
        self.mappings.read().await.clone()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    pub async fn close(&self) {
        self.scope.close().await;
        let mut guard = self.writer.lock().await;
        *guard = None;
        let listeners = self.listeners.lock().await;
        for (_, scope) in listeners.iter() {
            scope.close().await;
        }
    }

    async fn authenticate(&self) -> Result<(), ClientError> {
        let body = AuthenticateBody {
            auth_code: self.config.auth_code.clone(),
            secret_key: self.config.secret_key.clone(),
        };
        let response = self
            .send_command(CommandType::Authenticate, 0, serde_json::to_value(body).unwrap_or(Value::Null))
            .await?;
        if !response.success {
            return Err(ClientError::AuthFailed(response.error.unwrap_or_default()));
        }
        let client_id = response
            .response_body
            .get("client_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::AuthFailed("authenticate response missing client_id".into()))?;
        *self.client_id.write().await = Some(client_id);
        info!(client_id, "authenticated with server");
        Ok(())
    }

    pub async fn request_config(&self) -> Result<Vec<PortMapping>, ClientError> {
        let response = self.send_command(CommandType::ConfigGet, 0, Value::Null).await?;
        if !response.success {
            return Err(ClientError::CommandFailed(response.error.unwrap_or_default()));
        }
        let body: ConfigSetBody = serde_json::from_value(response.response_body)
            .map_err(|e| ClientError::CommandFailed(format!("malformed config_get response: {e}")))?;
        self.apply_config(body.mappings.clone()).await;
        Ok(body.mappings)
    }

    pub async fn create_mapping(&self, mapping: PortMapping) -> Result<String, ClientError> {
        let body = serde_json::json!({ "mapping": mapping });
        let response = self.send_command(CommandType::PortMapCreate, 0, body).await?;
        if !response.success {
            return Err(ClientError::CommandFailed(response.error.unwrap_or_default()));
        }
        Ok(response
            .response_body
            .get("mapping_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn remove_mapping(&self, mapping_id: impl Into<String>) -> Result<(), ClientError> {
        let body = serde_json::json!({ "mapping_id": mapping_id.into() });
        let response = self.send_command(CommandType::PortMapRemove, 0, body).await?;
        if !response.success {
            return Err(ClientError::CommandFailed(response.error.unwrap_or_default()));
        }
        Ok(())
    }

    /// Sends one framed command on the main control connection and awaits
    /// its correlated `Response` (spec §5: "correlation is by command_id /
    /// request_id" since handler execution happens off the session's
    /// read-loop thread, so replies are not guaranteed in request order).
    async fn send_command(
        &self,
        command_type: CommandType,
        receiver_id: u64,
        body: Value,
    ) -> Result<ResponseBody, ClientError> {
        let command_id = uuid::Uuid::new_v4().to_string();
        let sender_id = self.client_id().await.unwrap_or(0);
        let command = CommandPacket::new(command_type, command_id.clone(), String::new(), sender_id, receiver_id, body);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(command_id.clone(), tx);

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            self.pending.remove(&command_id);
            return Err(ClientError::Closed);
        };
        writer.write_packet(&TransferPacket::Command(command), true, None).await?;
        drop(guard);

        match timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.remove(&command_id);
                Err(ClientError::Timeout)
            }
        }
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) {
        let scope = self.scope.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let mut guard = self.writer.lock().await;
                let Some(writer) = guard.as_mut() else { return };
                if let Err(e) = writer.write_packet(&TransferPacket::Heartbeat, true, None).await {
                    warn!(error = %e, "heartbeat write failed, control connection is likely dead");
                    return;
                }
            }
        });
    }

    async fn read_loop(self: Arc<Self>, mut reader: PacketReader<BoxedReader>) {
        loop {
            let result = tokio::select! {
                _ = self.scope.cancelled() => return,
                r = reader.read_packet() => r,
            };
            match result {
                Ok((TransferPacket::Heartbeat, _)) => {
                    // The server only updates `last_heartbeat_at` from the
                    // client's heartbeats; it never sends one back.
                }
                Ok((TransferPacket::Command(command), _)) => self.dispatch(command).await,
                Err(StreamError::Eof) => {
                    debug!("control connection closed by server");
                    self.scope.close().await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "control connection read error");
                    self.scope.close().await;
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, command: CommandPacket) {
        match command.command_type {
            CommandType::Response => {
                let Ok(body) = command.decode_body::<ResponseBody>() else {
                    warn!("malformed response body");
                    return;
                };
                if let Some((_, tx)) = self.pending.remove(&command.command_id) {
                    let _ = tx.send(body);
                } else {
                    debug!(command_id = %command.command_id, "response for an unknown or timed-out command");
                }
            }
            CommandType::ConfigSet => {
                let Ok(body) = command.decode_body::<ConfigSetBody>() else {
                    warn!("malformed config_set body");
                    return;
                };
                self.apply_config(body.mappings).await;
            }
            CommandType::TunnelOpenRequest => {
                let client = self.clone();
                tokio::spawn(async move { target::handle_tunnel_open_push(client, command).await });
            }
            other => {
                debug!(command_type = ?other, "unhandled command on control connection, ignoring");
            }
        }
    }

    /// Replaces the cached mapping view and reconciles source-side
    /// listeners against it (spec §4.9: the pusher always sends the full
    /// current set, never a diff — reconciliation is this crate's job).
    async fn apply_config(self: &Arc<Self>, mappings: Vec<PortMapping>) {
        *self.mappings.write().await = mappings.clone();
        let my_id = self.client_id().await.unwrap_or(0);
        let wanted: HashMap<u16, PortMapping> = mappings
            .into_iter()
            .filter(|m| m.source_client_id == my_id && m.is_active())
            .map(|m| (m.source_port, m))
            .collect();

        let mut listeners = self.listeners.lock().await;
        listeners.retain(|port, scope| {
            if !wanted.contains_key(port) {
                let scope = scope.clone();
                tokio::spawn(async move { scope.close().await });
                false
            } else {
                true
            }
        });

        for (port, mapping) in wanted {
            if listeners.contains_key(&port) {
                continue;
            }
            let listener_scope = self.scope.child(format!("source-listener-{port}"), || async { Ok(()) });
            listeners.insert(port, listener_scope.clone());
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = source::serve_source_mapping(client, mapping, listener_scope).await {
                    warn!(port, error = %e, "source listener exited");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_transformer_defaults_to_identity() {
        let cfg = TransformConfig::default();
        let t = build_transformer(&cfg).unwrap();
        assert!(t.is_identity());
    }

    #[test]
    fn build_transformer_honors_compression_and_encryption_flags() {
        let cfg = TransformConfig {
            enable_compression: true,
            compression_level: 6,
            enable_encryption: true,
            encryption_method: "aes-128-gcm".into(),
            encryption_key: "0".repeat(16),
        };
        let t = build_transformer(&cfg).unwrap();
        assert!(!t.is_identity());
        assert!(t.uses_compression());
        assert!(t.uses_encryption());
    }

    #[test]
    fn build_transformer_rejects_an_unknown_encryption_method() {
        let cfg = TransformConfig {
            enable_compression: false,
            compression_level: 0,
            enable_encryption: true,
            encryption_method: "rot13".into(),
            encryption_key: "key".into(),
        };
        assert!(build_transformer(&cfg).is_err());
    }

    #[test]
    fn anonymous_config_has_an_empty_auth_code() {
        let config = ClientConfig::anonymous("127.0.0.1:9000".parse().unwrap(), "sekret");
        assert!(config.auth_code.is_empty());
        assert_eq!(config.secret_key, "sekret");
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }
}
