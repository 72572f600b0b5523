//! Command service (spec §4.8): the dispatch table for every control
//! command that isn't a tunnel-open handshake (the session manager forwards
//! those synchronously straight to the tunnel manager — see
//! `tunnox-session`'s crate doc comment). Subscribes to `CommandReceived`,
//! runs the matching handler, and publishes `CommandCompleted` so the
//! session's response router can write the reply frame. Handler execution
//! never blocks the read loop: the event bus is the only thing connecting
//! the two.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use tunnox_events::{Event, EventBus, EventError, EventHandler, EventKind};
use tunnox_ids::IdManager;
use tunnox_proto::{
    AuthenticateBody, CommandPacket, CommandType, ConfigSetBody, PortMapCreateBody, PortMapRemoveBody,
};
use tunnox_session::{CloseReason, CommandCompletedPayload, CommandReceivedPayload, SessionManager};
use tunnox_store::{
    client_key, port_mapping_key, Client, ClientStatus, ClientType, KvStore, PortMapping, PortMappingStatus,
    StoreResult, TypedStore, CLIENT_PREFIX, PORT_MAPPING_PREFIX,
};

/// Published whenever a mapping is created or removed, so the config pusher
/// (C9) knows which clients need a refreshed `ConfigSet` (spec §4.9). Kept
/// here, next to the handlers that are the only producers of this event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingChangedPayload {
    pub affected_client_ids: Vec<u64>,
}

struct Outcome {
    success: bool,
    body: Value,
    error: Option<String>,
}

impl Outcome {
    fn ok(body: Value) -> Self {
        Self { success: true, body, error: None }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self { success: false, body: Value::Null, error: Some(error.into()) }
    }
}

/// Dispatches `CommandReceived` events to per-command-type handlers (spec
/// §4.8's table). Holds everything a handler might need: the store for
/// client/mapping records, the session manager to resolve `connection_id ->
/// client_id` and to close connections, and an id generator for freshly
/// created clients/mappings.
pub struct CommandService {
    store: Arc<dyn KvStore>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    ids: IdManager,
    node_id: String,
}

impl CommandService {
    pub fn new(
        store: Arc<dyn KvStore>,
        bus: Arc<EventBus>,
        sessions: Arc<SessionManager>,
        ids: IdManager,
        node_id: impl Into<String>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            store,
            bus: bus.clone(),
            sessions,
            ids,
            node_id: node_id.into(),
        });
        bus.subscribe(EventKind::CommandReceived, service.clone());
        service
    }

    async fn dispatch(&self, connection_id: i64, command: &CommandPacket) -> Outcome {
        match &command.command_type {
            CommandType::Authenticate => self.handle_authenticate(connection_id, command).await,
            CommandType::Heartbeat => Outcome::ok(Value::Null),
            CommandType::PortMapCreate => self.handle_port_map_create(command).await,
            CommandType::PortMapRemove => self.handle_port_map_remove(command).await,
            CommandType::ConfigGet => self.handle_config_get(connection_id).await,
            CommandType::Disconnect => self.handle_disconnect(connection_id).await,
            CommandType::TunnelOpenRequest | CommandType::TunnelOpenResponse => {
                warn!("tunnel-open command reached the command service instead of the session's synchronous path");
                Outcome::failed("tunnel-open commands are not handled here")
            }
            CommandType::Response | CommandType::ConfigSet => {
                Outcome::failed("server-originated command type received as a request")
            }
            CommandType::Unknown(other) => {
                info!(command_type = %other, "unknown command type, ignoring");
                Outcome::failed(format!("unknown command type: {other}"))
            }
        }
    }

    async fn handle_authenticate(&self, connection_id: i64, command: &CommandPacket) -> Outcome {
        let body: AuthenticateBody = match command.decode_body() {
            Ok(b) => b,
            Err(e) => return Outcome::failed(format!("malformed authenticate body: {e}")),
        };

        let client = if body.auth_code.is_empty() {
            match self.create_anonymous_client(&body.secret_key).await {
                Ok(c) => c,
                Err(e) => return Outcome::failed(e.to_string()),
            }
        } else {
            match self.authenticate_registered_client(&body).await {
                Ok(c) => c,
                Err(e) => return Outcome::failed(e),
            }
        };

        if let Err(e) = self.sessions.authenticate(connection_id, client.id).await {
            return Outcome::failed(e.to_string());
        }

        Outcome::ok(serde_json::json!({ "client_id": client.id }))
    }

    async fn create_anonymous_client(&self, secret_key: &str) -> StoreResult<Client> {
        let id = self.ids.next_client_id().await?;
        let client = Client {
            id,
            user_id: String::new(),
            client_type: ClientType::Anonymous,
            auth_code: self.ids.next_token("anon_"),
            secret_key: secret_key.to_string(),
            node_id: self.node_id.clone(),
            status: ClientStatus::Online,
        };
        self.store.put_json(&client_key(id), &client).await?;
        Ok(client)
    }

    async fn authenticate_registered_client(&self, body: &AuthenticateBody) -> Result<Client, String> {
        let mut client = self
            .find_client_by_auth_code(&body.auth_code)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "unknown auth_code".to_string())?;

        if client.status == ClientStatus::Blocked {
            return Err("client is blocked".to_string());
        }
        if client.secret_key != body.secret_key {
            return Err("secret key mismatch".to_string());
        }

        client.status = ClientStatus::Online;
        client.node_id = self.node_id.clone();
        self.store
            .put_json(&client_key(client.id), &client)
            .await
            .map_err(|e| e.to_string())?;
        Ok(client)
    }

    async fn find_client_by_auth_code(&self, auth_code: &str) -> StoreResult<Option<Client>> {
        for key in self.store.list_prefix(CLIENT_PREFIX).await? {
            if let Some(client) = self.store.get_json::<Client>(&key).await? {
                if client.auth_code == auth_code {
                    return Ok(Some(client));
                }
            }
        }
        Ok(None)
    }

    async fn handle_port_map_create(&self, command: &CommandPacket) -> Outcome {
        let body: PortMapCreateBody = match command.decode_body() {
            Ok(b) => b,
            Err(e) => return Outcome::failed(format!("malformed port_map_create body: {e}")),
        };

        let id = self.ids.next_mapping_id();
        let mapping = PortMapping {
            id: id.clone(),
            status: PortMappingStatus::Active,
            ..body.mapping
        };

        if let Err(e) = self.store.put_json(&port_mapping_key(&id), &mapping).await {
            return Outcome::failed(e.to_string());
        }

        self.publish_mapping_changed(&mapping);
        Outcome::ok(serde_json::json!({ "mapping_id": id }))
    }

    async fn handle_port_map_remove(&self, command: &CommandPacket) -> Outcome {
        let body: PortMapRemoveBody = match command.decode_body() {
            Ok(b) => b,
            Err(e) => return Outcome::failed(format!("malformed port_map_remove body: {e}")),
        };

        let existing: Option<PortMapping> = match self.store.get_json(&port_mapping_key(&body.mapping_id)).await {
            Ok(v) => v,
            Err(e) => return Outcome::failed(e.to_string()),
        };
        let Some(mapping) = existing else {
            return Outcome::failed("mapping not found");
        };

        if let Err(e) = self.store.delete(&port_mapping_key(&body.mapping_id)).await {
            return Outcome::failed(e.to_string());
        }

        self.publish_mapping_changed(&mapping);
        Outcome::ok(serde_json::json!({ "mapping_id": body.mapping_id }))
    }

    fn publish_mapping_changed(&self, mapping: &PortMapping) {
        let payload = MappingChangedPayload {
            affected_client_ids: vec![mapping.source_client_id, mapping.target_client_id],
        };
        self.bus
            .publish(Event::with_payload(EventKind::MappingChanged, "commands", &payload).expect("payload serializes"));
    }

    async fn handle_config_get(&self, connection_id: i64) -> Outcome {
        let Some(conn) = self.sessions.connection(connection_id).await else {
            return Outcome::failed("connection not found");
        };
        let Some(client_id) = conn.client_id() else {
            return Outcome::failed("connection is not authenticated");
        };

        match mappings_for_client(self.store.as_ref(), client_id).await {
            Ok(mappings) => {
                Outcome::ok(serde_json::to_value(ConfigSetBody { mappings }).unwrap_or(Value::Null))
            }
            Err(e) => Outcome::failed(e.to_string()),
        }
    }

    async fn handle_disconnect(&self, connection_id: i64) -> Outcome {
        if let Some(conn) = self.sessions.connection(connection_id).await {
            // Closing synchronously here would remove the connection (and
            // its writer) from the session manager before the response
            // router gets a chance to write the ack frame; spawn it the
            // same way `SessionManager::authenticate` defers closing a
            // superseded connection.
            tokio::spawn(async move { conn.close(CloseReason::Graceful).await });
        }
        Outcome::ok(Value::Null)
    }
}

/// A client's current view of its own mappings — every active mapping
/// where it is source or target (spec §4.9: "a client's view contains only
/// those mappings where it is source or target"). Shared by `ConfigGet`
/// and the config pusher (C9), which both need exactly this projection.
pub async fn mappings_for_client(store: &dyn KvStore, client_id: u64) -> StoreResult<Vec<PortMapping>> {
    let mut mappings = Vec::new();
    for key in store.list_prefix(PORT_MAPPING_PREFIX).await? {
        if let Some(mapping) = store.get_json::<PortMapping>(&key).await? {
            if mapping.is_active() && mapping.involves(client_id) {
                mappings.push(mapping);
            }
        }
    }
    Ok(mappings)
}

#[async_trait]
impl EventHandler for CommandService {
    async fn handle(&self, event: Event) -> Result<(), EventError> {
        if event.kind != EventKind::CommandReceived {
            return Ok(());
        }
        let payload: CommandReceivedPayload =
            serde_json::from_value(event.payload).map_err(|e| EventError::Handler(e.to_string()))?;

        let started = Instant::now();
        let outcome = self.dispatch(payload.connection_id, &payload.command).await;
        let processing_time_ms = started.elapsed().as_millis() as i64;

        self.bus.publish(
            Event::with_payload(
                EventKind::CommandCompleted,
                "commands",
                &CommandCompletedPayload {
                    connection_id: payload.connection_id,
                    command_id: payload.command.command_id.clone(),
                    success: outcome.success,
                    response_body: outcome.body,
                    error: outcome.error,
                    processing_time_ms,
                },
            )
            .expect("payload serializes"),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;
    use tunnox_lifecycle::Scope;
    use tunnox_proto::{CommandPacket, TunnelOpenRequestBody};
    use tunnox_store::MemoryKvStore;
    use tunnox_transport::BoxedStream;

    fn ids(store: Arc<dyn KvStore>) -> IdManager {
        IdManager::new(store)
    }

    async fn duplex_boxed_pair() -> (BoxedStream, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(8192);
        (Box::new(a), b)
    }

    struct CompletionRecorder(AsyncMutex<Vec<CommandCompletedPayload>>);

    #[async_trait]
    impl EventHandler for CompletionRecorder {
        async fn handle(&self, event: Event) -> Result<(), EventError> {
            if event.kind == EventKind::CommandCompleted {
                let payload: CommandCompletedPayload = serde_json::from_value(event.payload).unwrap();
                self.0.lock().await.push(payload);
            }
            Ok(())
        }
    }

    async fn harness() -> (Arc<dyn KvStore>, Arc<EventBus>, Arc<SessionManager>, Arc<CommandService>, Arc<CompletionRecorder>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let bus = EventBus::new();
        let sessions = SessionManager::new(bus.clone(), ids(store.clone()), Scope::new("root"));
        let service = CommandService::new(store.clone(), bus.clone(), sessions.clone(), ids(store.clone()), "node-a");
        let recorder = Arc::new(CompletionRecorder(AsyncMutex::new(Vec::new())));
        bus.subscribe(EventKind::CommandCompleted, recorder.clone());
        (store, bus, sessions, service, recorder)
    }

    async fn connect(sessions: &Arc<SessionManager>, addr: &str) -> (i64, tokio::io::DuplexStream) {
        let (boxed, peer) = duplex_boxed_pair().await;
        sessions.handle_accept(boxed, addr.parse::<SocketAddr>().unwrap()).await;
        let id = *sessions.connections_snapshot().await.keys().next().unwrap();
        (id, peer)
    }

    fn authenticate_command(auth_code: &str, secret_key: &str) -> CommandPacket {
        CommandPacket::new(
            CommandType::Authenticate,
            "cmd-auth",
            "tok",
            0,
            0,
            serde_json::to_value(AuthenticateBody {
                auth_code: auth_code.to_string(),
                secret_key: secret_key.to_string(),
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn anonymous_authenticate_creates_a_client_and_registers_the_connection() {
        let (_, bus, sessions, _service, recorder) = harness().await;
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:1").await;

        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: authenticate_command("", "s3cr3t") },
            )
            .unwrap(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        let completed = recorder.0.lock().await;
        assert_eq!(completed.len(), 1);
        assert!(completed[0].success);
        let client_id = completed[0].response_body["client_id"].as_u64().unwrap();
        assert!(sessions.connection_for_client(client_id).await.is_some());
    }

    #[tokio::test]
    async fn registered_authenticate_rejects_a_wrong_secret() {
        let (store, bus, sessions, _service, recorder) = harness().await;
        store
            .put_json(
                &client_key(10000001),
                &Client {
                    id: 10000001,
                    user_id: "u1".into(),
                    client_type: ClientType::Registered,
                    auth_code: "code-1".into(),
                    secret_key: "right".into(),
                    node_id: "node-a".into(),
                    status: ClientStatus::Offline,
                },
            )
            .await
            .unwrap();
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:2").await;

        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: authenticate_command("code-1", "wrong") },
            )
            .unwrap(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        let completed = recorder.0.lock().await;
        assert_eq!(completed.len(), 1);
        assert!(!completed[0].success);
    }

    #[tokio::test]
    async fn port_map_create_then_config_get_returns_the_mapping_for_an_involved_client() {
        let (_, bus, sessions, _service, recorder) = harness().await;
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:3").await;
        sessions.authenticate(conn_id, 10000005).await.unwrap();

        let create = CommandPacket::new(
            CommandType::PortMapCreate,
            "cmd-create",
            "tok",
            10000005,
            0,
            serde_json::to_value(PortMapCreateBody {
                mapping: PortMapping {
                    id: String::new(),
                    user_id: "u1".into(),
                    source_client_id: 10000005,
                    target_client_id: 10000006,
                    protocol: tunnox_store::Protocol::Tcp,
                    source_port: 8080,
                    target_host: "10.0.0.1".into(),
                    target_port: 80,
                    secret_key: "s".into(),
                    status: PortMappingStatus::Inactive,
                    transform: Default::default(),
                },
            })
            .unwrap(),
        );
        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: create },
            )
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(recorder.0.lock().await[0].success);

        let get = CommandPacket::new(CommandType::ConfigGet, "cmd-get", "tok", 10000005, 0, serde_json::json!({}));
        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: get },
            )
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        let completed = recorder.0.lock().await;
        assert_eq!(completed.len(), 2);
        let body: ConfigSetBody = serde_json::from_value(completed[1].response_body.clone()).unwrap();
        assert_eq!(body.mappings.len(), 1);
        assert_eq!(body.mappings[0].target_client_id, 10000006);
    }

    #[tokio::test]
    async fn port_map_create_publishes_a_mapping_changed_event() {
        let (_, bus, sessions, _service, _recorder) = harness().await;
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:4").await;

        struct MappingRecorder(AtomicUsize);
        #[async_trait]
        impl EventHandler for MappingRecorder {
            async fn handle(&self, event: Event) -> Result<(), EventError> {
                if event.kind == EventKind::MappingChanged {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }
        let mapping_recorder = Arc::new(MappingRecorder(AtomicUsize::new(0)));
        bus.subscribe(EventKind::MappingChanged, mapping_recorder.clone());

        let create = CommandPacket::new(
            CommandType::PortMapCreate,
            "cmd-create",
            "tok",
            0,
            0,
            serde_json::to_value(PortMapCreateBody {
                mapping: PortMapping {
                    id: String::new(),
                    user_id: "u1".into(),
                    source_client_id: 1,
                    target_client_id: 2,
                    protocol: tunnox_store::Protocol::Tcp,
                    source_port: 8080,
                    target_host: "h".into(),
                    target_port: 80,
                    secret_key: "s".into(),
                    status: PortMappingStatus::Inactive,
                    transform: Default::default(),
                },
            })
            .unwrap(),
        );
        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: create },
            )
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mapping_recorder.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_closes_the_connection() {
        let (_, bus, sessions, _service, recorder) = harness().await;
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:5").await;

        let disconnect = CommandPacket::new(CommandType::Disconnect, "cmd-bye", "tok", 0, 0, serde_json::json!({}));
        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: disconnect },
            )
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(recorder.0.lock().await[0].success);
        assert!(sessions.connection(conn_id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_command_type_fails_without_panicking() {
        let (_, bus, sessions, _service, recorder) = harness().await;
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:6").await;

        let weird = CommandPacket::new(
            CommandType::Unknown("future_thing".into()),
            "cmd-weird",
            "tok",
            0,
            0,
            serde_json::json!({}),
        );
        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command: weird },
            )
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!recorder.0.lock().await[0].success);
    }

    #[tokio::test]
    async fn tunnel_open_request_reaching_the_service_is_rejected_defensively() {
        let (_, bus, sessions, _service, recorder) = harness().await;
        let (conn_id, _peer) = connect(&sessions, "127.0.0.1:7").await;

        let body = TunnelOpenRequestBody {
            tunnel_id: "t1".into(),
            mapping_id: "m1".into(),
            secret_key: "s".into(),
            protocol: tunnox_store::Protocol::Tcp,
            target_host: "h".into(),
            target_port: 1,
            enable_compression: false,
            compression_level: 0,
            enable_encryption: false,
            encryption_method: String::new(),
            encryption_key: String::new(),
        };
        let command = CommandPacket::new(
            CommandType::TunnelOpenRequest,
            "cmd-tun",
            "tok",
            0,
            0,
            serde_json::to_value(body).unwrap(),
        );
        bus.publish(
            Event::with_payload(
                EventKind::CommandReceived,
                "test",
                &CommandReceivedPayload { connection_id: conn_id, command },
            )
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!recorder.0.lock().await[0].success);
    }
}
