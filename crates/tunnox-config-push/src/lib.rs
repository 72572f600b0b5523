//! Config pusher (spec §4.9): on mapping create/update/delete, pushes each
//! affected client its full, current mapping view. No diffing — the pusher
//! always resends the complete set, and a client that misses a push is
//! expected to re-request via `ConfigGet` after reconnecting (spec §4.9,
//! SPEC_FULL.md C9 supplement).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use tunnox_commands::{mappings_for_client, MappingChangedPayload};
use tunnox_events::{Event, EventBus, EventError, EventHandler, EventKind};
use tunnox_proto::{CommandPacket, CommandType, ConfigSetBody};
use tunnox_session::SessionManager;
use tunnox_store::KvStore;

pub struct ConfigPusher {
    store: Arc<dyn KvStore>,
    sessions: Arc<SessionManager>,
}

impl ConfigPusher {
    pub fn new(store: Arc<dyn KvStore>, bus: Arc<EventBus>, sessions: Arc<SessionManager>) -> Arc<Self> {
        let pusher = Arc::new(Self { store, sessions });
        bus.subscribe(EventKind::MappingChanged, pusher.clone());
        pusher
    }

    /// Sends `client_id` its full current mapping view over its control
    /// connection, if it is online. A no-op (logged, not an error) when the
    /// client has no connection — the standard "re-request on reconnect"
    /// fallback.
    pub async fn push_to_client(&self, client_id: u64) {
        let Some(conn) = self.sessions.connection_for_client(client_id).await else {
            debug!(client_id, "skipping config push, client is offline");
            return;
        };

        let mappings = match mappings_for_client(self.store.as_ref(), client_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(client_id, error = %e, "failed to load mappings for config push");
                return;
            }
        };

        let body = ConfigSetBody { mappings };
        let command = CommandPacket::new(
            CommandType::ConfigSet,
            String::new(),
            String::new(),
            0,
            client_id,
            serde_json::to_value(body).unwrap_or(serde_json::Value::Null),
        );

        if let Err(e) = conn.send_command(command).await {
            warn!(client_id, error = %e, "config push failed");
        }
    }
}

#[async_trait]
impl EventHandler for ConfigPusher {
    async fn handle(&self, event: Event) -> Result<(), EventError> {
        if event.kind != EventKind::MappingChanged {
            return Ok(());
        }
        let payload: MappingChangedPayload =
            serde_json::from_value(event.payload).map_err(|e| EventError::Handler(e.to_string()))?;

        for client_id in payload.affected_client_ids {
            self.push_to_client(client_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tunnox_ids::IdManager;
    use tunnox_lifecycle::Scope;
    use tunnox_proto::{build_transfer, TransferPacket};
    use tunnox_store::{
        port_mapping_key, MemoryKvStore, PortMapping, PortMappingStatus, Protocol, TransformConfig, TypedStore,
    };
    use tunnox_transport::BoxedStream;

    async fn duplex_boxed_pair() -> (BoxedStream, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(8192);
        (Box::new(a), b)
    }

    fn mapping(source: u64, target: u64) -> PortMapping {
        PortMapping {
            id: "map1".into(),
            user_id: "u1".into(),
            source_client_id: source,
            target_client_id: target,
            protocol: Protocol::Tcp,
            source_port: 8080,
            target_host: "10.0.0.1".into(),
            target_port: 80,
            secret_key: "s".into(),
            status: PortMappingStatus::Active,
            transform: TransformConfig::default(),
        }
    }

    #[tokio::test]
    async fn mapping_changed_pushes_a_config_set_to_each_online_affected_client() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        store.put_json(&port_mapping_key("map1"), &mapping(10000001, 10000002)).await.unwrap();

        let bus = EventBus::new();
        let ids = IdManager::new(store.clone());
        let sessions = SessionManager::new(bus.clone(), ids, Scope::new("root"));
        let _pusher = ConfigPusher::new(store.clone(), bus.clone(), sessions.clone());

        let (boxed, mut peer) = duplex_boxed_pair().await;
        sessions.handle_accept(boxed, "127.0.0.1:1".parse::<SocketAddr>().unwrap()).await;
        let conn_id = *sessions.connections_snapshot().await.keys().next().unwrap();
        sessions.authenticate(conn_id, 10000001).await.unwrap();

        bus.publish(
            Event::with_payload(
                EventKind::MappingChanged,
                "test",
                &MappingChangedPayload { affected_client_ids: vec![10000001] },
            )
            .unwrap(),
        );

        let parsed = tokio::time::timeout(Duration::from_millis(200), build_transfer(&mut peer))
            .await
            .expect("config push should arrive")
            .unwrap();
        match parsed {
            TransferPacket::Command(command) => {
                assert_eq!(command.command_type, CommandType::ConfigSet);
                let body: ConfigSetBody = command.decode_body().unwrap();
                assert_eq!(body.mappings.len(), 1);
                assert_eq!(body.mappings[0].id, "map1");
            }
            TransferPacket::Heartbeat => panic!("expected a command frame"),
        }
    }

    #[tokio::test]
    async fn offline_client_is_skipped_without_erroring() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let bus = EventBus::new();
        let ids = IdManager::new(store.clone());
        let sessions = SessionManager::new(bus.clone(), ids, Scope::new("root"));
        let pusher = ConfigPusher::new(store, bus, sessions);

        pusher.push_to_client(99999999).await;
    }
}
