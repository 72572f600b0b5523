//! Server implementation (spec §4.1-§4.11): builds every control-plane
//! component around a shared `KvStore`/`Broker`/`EventBus`, then runs one
//! accept loop per configured transport, plus the cross-node forward
//! session bridge listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use tunnox_broker::{Broker, MemoryBroker};
use tunnox_commands::CommandService;
use tunnox_config_push::ConfigPusher;
use tunnox_events::EventBus;
use tunnox_ids::IdManager;
use tunnox_lifecycle::Scope;
use tunnox_node_pool::{NodePoolConfig, NodePoolRegistry};
use tunnox_session::{SessionHandler, SessionManager};
use tunnox_store::{node_key, KvStore, MemoryKvStore, Node, TypedStore};
use tunnox_transport::TransportAdapter;
use tunnox_transport_tcp::TcpAdapter;
use tunnox_transport_udp::UdpAdapter;
use tunnox_transport_websocket::WebSocketAdapter;
use tunnox_tunnel::{ForwardSessionListener, TunnelManager};

/// Which transports this node accepts control connections on. The wire
/// protocol is identical across all of them (spec §4.6): only the framing
/// underneath differs.
#[derive(Debug, Clone)]
pub struct ListenAddrs {
    pub tcp: Option<SocketAddr>,
    pub websocket: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
}

impl Default for ListenAddrs {
    fn default() -> Self {
        Self { tcp: Some(([0, 0, 0, 0], 7000).into()), websocket: None, udp: None }
    }
}

/// Everything needed to start a node (spec §4.10/§4.11: node identity and
/// its forward-session bridge address are what peers use to reach it).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub node_id: String,
    pub listen: ListenAddrs,
    /// Address this node's `ForwardSessionListener` binds, and the value
    /// recorded in its own `Node` record for peers to dial (spec §4.10).
    pub bridge_addr: SocketAddr,
    pub node_pool: NodePoolConfig,
}

impl ServerConfig {
    pub fn single_node(node_id: impl Into<String>, tcp_addr: SocketAddr, bridge_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            listen: ListenAddrs { tcp: Some(tcp_addr), websocket: None, udp: None },
            bridge_addr,
            node_pool: NodePoolConfig::default(),
        }
    }
}

/// A running (or not-yet-started) server node. Built once via [`Server::new`]
/// then consumed by [`Server::run`], mirroring the teacher's
/// `AgentServer::new`/`run` split.
pub struct Server {
    config: ServerConfig,
    scope: Scope,
    store: Arc<dyn KvStore>,
    broker: Arc<dyn Broker>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    tunnels: Arc<TunnelManager>,
    // Kept alive for the node's lifetime even though nothing reads them
    // back out; both self-subscribe to the event bus in their constructors.
    _commands: Arc<CommandService>,
    _config_pusher: Arc<ConfigPusher>,
}

impl Server {
    /// Wires every component together. Uses the in-memory reference
    /// implementations of the store and broker (both out-of-scope external
    /// collaborators per spec §1) — a real deployment swaps these for a
    /// networked KV store and message broker without touching anything
    /// built here.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let scope = Scope::new(format!("tunnox-server-{}", config.node_id));
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        let ids = IdManager::new(store.clone());

        let sessions = SessionManager::new(bus.clone(), ids.clone(), scope.clone());
        let commands = CommandService::new(store.clone(), bus.clone(), sessions.clone(), ids.clone(), config.node_id.clone());
        let config_pusher = ConfigPusher::new(store.clone(), bus.clone(), sessions.clone());
        let node_pools = NodePoolRegistry::new(config.node_pool.clone(), scope.clone());
        let tunnels = TunnelManager::new(
            sessions.clone(),
            store.clone(),
            broker.clone(),
            node_pools,
            ids,
            config.node_id.clone(),
            scope.clone(),
        );

        Arc::new(Self {
            config,
            scope,
            store,
            broker,
            bus,
            sessions,
            tunnels,
            _commands: commands,
            _config_pusher: config_pusher,
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope.clone()
    }

    /// Runs until the node's scope closes. Registers this node's own
    /// `Node` record (so peers resolving a target client's `node_id` can
    /// find this node's bridge address), starts every configured transport
    /// accept loop and the forward-session bridge listener, then waits.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.register_self().await?;
        self.sessions.set_tunnel_sink(self.tunnels.clone()).await;

        let mut adapters: Vec<Arc<dyn TransportAdapter>> = Vec::new();

        if let Some(addr) = self.config.listen.tcp {
            let adapter: Arc<dyn TransportAdapter> = Arc::new(TcpAdapter::new());
            adapter.listen(addr).await?;
            info!(%addr, "tcp control listener up");
            adapters.push(adapter);
        }
        if let Some(addr) = self.config.listen.websocket {
            let adapter: Arc<dyn TransportAdapter> = Arc::new(WebSocketAdapter::new());
            adapter.listen(addr).await?;
            info!(%addr, "websocket control listener up");
            adapters.push(adapter);
        }
        if let Some(addr) = self.config.listen.udp {
            let adapter: Arc<dyn TransportAdapter> = Arc::new(UdpAdapter::new());
            adapter.listen(addr).await?;
            info!(%addr, "udp control listener up");
            adapters.push(adapter);
        }

        let handler = Arc::new(SessionHandler(self.sessions.clone()));
        for adapter in adapters {
            let handler = handler.clone();
            let scope = self.scope.clone();
            let name = adapter.name();
            scope.clone().add_cleanup(move || {
                let adapter = adapter.clone();
                async move {
                    adapter.close().await.map_err(|e| tunnox_lifecycle::CleanupError::new(e.to_string()))
                }
            });
            tokio::spawn(async move {
                if let Err(e) = adapter.accept_loop(scope, handler).await {
                    warn!(transport = name, error = %e, "accept loop exited with an error");
                }
            });
        }

        let bridge_listener = ForwardSessionListener::bind(self.config.bridge_addr, vec![self.config.bridge_addr.ip().to_string()])?;
        info!(addr = %self.config.bridge_addr, "forward session bridge listening");
        let tunnels = self.tunnels.clone();
        let bridge_scope = self.scope.clone();
        tokio::spawn(bridge_listener.serve(tunnels, bridge_scope));

        self.scope.cancelled().await;
        self.scope.close().await;
        Ok(())
    }

    async fn register_self(&self) -> anyhow::Result<()> {
        let node = Node {
            id: self.config.node_id.clone(),
            address: self.config.bridge_addr.to_string(),
            region: String::new(),
            last_seen_at: chrono::Utc::now().timestamp(),
        };
        self.store.put_json(&node_key(&node.id), &node).await?;
        Ok(())
    }
}
