//! Node connection pool (spec §4.10): one pool per peer server node, holding
//! between `min_conns` and `max_conns` multiplexed QUIC connections, each
//! supporting up to `max_streams_per_conn` concurrent forward sessions.
//!
//! Grounded directly on `quinn::Connection`'s native stream multiplexing
//! (already a workspace dependency via `tunnox-transport-quic`) rather than
//! on an HTTP/2 crate — a cross-node forward session is exactly one
//! bidirectional QUIC stream, dialed the same way `QuicAdapter::dial` opens
//! one for a client control connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use quinn::{RecvStream, SendStream};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use tunnox_lifecycle::Scope;
use tunnox_proto::{build_heartbeat, build_transfer, TransferPacket};
use tunnox_transport::BoxedStream;
use tunnox_transport_quic::tls;

#[derive(Debug, Error)]
pub enum NodePoolError {
    #[error("pool is at max_conns capacity and no connection has a free stream slot")]
    NoCapacity,
    #[error("dial to {0} failed: {1}")]
    Dial(SocketAddr, String),
    #[error("opening a stream on an existing connection failed: {0}")]
    StreamOpen(String),
    #[error("pool is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type NodePoolResult<T> = Result<T, NodePoolError>;

/// Tunable bounds for one pool (spec §4.10); defaults match the spec's
/// named intervals where given, and are documented choices in DESIGN.md
/// where the spec leaves a number unstated (e.g. `max_idle_time`).
#[derive(Debug, Clone)]
pub struct NodePoolConfig {
    pub min_conns: usize,
    pub max_conns: usize,
    pub max_streams_per_conn: usize,
    pub idle_sweep_interval: Duration,
    pub max_idle_time: Duration,
    /// Open Question resolution #4 (SPEC_FULL.md §9): liveness ping interval.
    pub liveness_interval: Duration,
    pub max_missed_pongs: u32,
    pub ping_timeout: Duration,
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 1,
            max_conns: 4,
            max_streams_per_conn: 64,
            idle_sweep_interval: Duration::from_secs(60),
            max_idle_time: Duration::from_secs(300),
            liveness_interval: Duration::from_secs(20),
            max_missed_pongs: 3,
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Decrements a connection's active-stream count (and re-arms its idle
/// clock if it reaches zero) when a [`ForwardSession`] is dropped or
/// explicitly unwrapped — covers the error paths too, since `Drop` runs
/// regardless of how the session's owner stopped using it.
struct StreamSlot {
    connection: Arc<PooledConnection>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        let remaining = self.connection.active_streams.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            *self.connection.idle_since.write().unwrap() = Some(Instant::now());
        }
    }
}

/// One bidirectional RPC stream opened against a peer node — a raw byte
/// pipe handed to the tunnel manager as the target leg of a cross-node
/// tunnel (spec §4.11 `attach_forward_session`).
pub struct ForwardSession {
    stream: BoxedStream,
    _slot: StreamSlot,
}

impl ForwardSession {
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

struct PooledConnection {
    connection: quinn::Connection,
    active_streams: AtomicUsize,
    idle_since: StdRwLock<Option<Instant>>,
    missed_pongs: AtomicU32,
    /// A bi-stream reserved at dial time for liveness pings, kept separate
    /// from caller-visible forward sessions so pings never compete with
    /// `max_streams_per_conn` for a slot.
    control: AsyncMutex<(SendStream, RecvStream)>,
}

impl PooledConnection {
    /// Attempts to claim one of `max_streams` concurrent slots. Returns
    /// `false` (no side effect) if the connection is already at capacity.
    fn try_reserve_slot(&self, max_streams: usize) -> bool {
        loop {
            let current = self.active_streams.load(Ordering::SeqCst);
            if current >= max_streams {
                return false;
            }
            if self
                .active_streams
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                *self.idle_since.write().unwrap() = None;
                return true;
            }
        }
    }

    fn is_idle_past(&self, max_idle_time: Duration) -> bool {
        if self.active_streams.load(Ordering::SeqCst) != 0 {
            return false;
        }
        match *self.idle_since.read().unwrap() {
            Some(since) => since.elapsed() > max_idle_time,
            None => false,
        }
    }
}

/// A pool of multiplexed connections to one peer node.
pub struct NodePool {
    peer_addr: SocketAddr,
    config: NodePoolConfig,
    endpoint: quinn::Endpoint,
    connections: RwLock<Vec<Arc<PooledConnection>>>,
    closed: AtomicBool,
    scope: Scope,
}

impl NodePool {
    /// Builds a pool for `peer_addr` and starts its idle-sweep and
    /// liveness-probe background tasks under a child of `parent_scope`.
    pub fn new(peer_addr: SocketAddr, config: NodePoolConfig, parent_scope: &Scope) -> NodePoolResult<Arc<Self>> {
        tls::ensure_crypto_provider();
        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(tls::client_config());

        let scope = parent_scope.child(format!("node-pool-{peer_addr}"), || async { Ok(()) });
        let pool = Arc::new(Self {
            peer_addr,
            config,
            endpoint,
            connections: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            scope,
        });

        pool.clone().spawn_idle_sweep();
        pool.clone().spawn_liveness();
        Ok(pool)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Scans existing connections for spare stream capacity; dials a new
    /// connection if none has room and the pool is under `max_conns`;
    /// otherwise fails fast with `NoCapacity` (spec §4.10, Open Question
    /// resolution #3 — never queued).
    pub async fn get_or_create_session(&self) -> NodePoolResult<ForwardSession> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodePoolError::Closed);
        }

        let candidate = {
            let conns = self.connections.read().await;
            conns.iter().find(|pc| pc.try_reserve_slot(self.config.max_streams_per_conn)).cloned()
        };

        if let Some(pc) = candidate {
            return self.open_stream_or_evict(pc).await;
        }

        let mut conns = self.connections.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodePoolError::Closed);
        }
        if conns.len() >= self.config.max_conns {
            return Err(NodePoolError::NoCapacity);
        }

        let pc = self.dial_new().await?;
        let reserved = pc.try_reserve_slot(self.config.max_streams_per_conn);
        conns.push(pc.clone());
        drop(conns);

        if !reserved {
            // max_streams_per_conn == 0 is a misconfiguration, not a race.
            return Err(NodePoolError::NoCapacity);
        }
        self.open_stream_or_evict(pc).await
    }

    async fn open_stream_or_evict(&self, pc: Arc<PooledConnection>) -> NodePoolResult<ForwardSession> {
        match pc.connection.open_bi().await {
            Ok((send, recv)) => Ok(ForwardSession {
                stream: Box::new(tokio::io::join(recv, send)),
                _slot: StreamSlot { connection: pc },
            }),
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "stream creation failed, evicting connection");
                self.remove_connection(&pc).await;
                Err(NodePoolError::StreamOpen(e.to_string()))
            }
        }
    }

    async fn dial_new(&self) -> NodePoolResult<Arc<PooledConnection>> {
        let connecting = self
            .endpoint
            .connect(self.peer_addr, "localhost")
            .map_err(|e| NodePoolError::Dial(self.peer_addr, e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| NodePoolError::Dial(self.peer_addr, e.to_string()))?;

        let (ctrl_send, ctrl_recv) = connection
            .open_bi()
            .await
            .map_err(|e| NodePoolError::Dial(self.peer_addr, e.to_string()))?;

        info!(peer = %self.peer_addr, "node pool dialed a new connection");
        Ok(Arc::new(PooledConnection {
            connection,
            active_streams: AtomicUsize::new(0),
            idle_since: StdRwLock::new(Some(Instant::now())),
            missed_pongs: AtomicU32::new(0),
            control: AsyncMutex::new((ctrl_send, ctrl_recv)),
        }))
    }

    async fn remove_connection(&self, pc: &Arc<PooledConnection>) {
        let mut conns = self.connections.write().await;
        let before = conns.len();
        conns.retain(|c| !Arc::ptr_eq(c, pc));
        if conns.len() != before {
            pc.connection.close(0u32.into(), b"removed from pool");
        }
    }

    /// Closes every connection and fails future calls (spec §4.10: "closes
    /// all connections; future `get_or_create_session` fails").
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut conns = self.connections.write().await;
        for pc in conns.drain(..) {
            pc.connection.close(0u32.into(), b"pool closed");
        }
        self.scope.close().await;
    }

    async fn ping(&self, pc: &Arc<PooledConnection>) -> bool {
        let mut guard = pc.control.lock().await;
        let (send, recv) = &mut *guard;
        let result = tokio::time::timeout(self.config.ping_timeout, async {
            build_heartbeat(send).await?;
            build_transfer(recv).await
        })
        .await;
        matches!(result, Ok(Ok(TransferPacket::Heartbeat)))
    }

    fn spawn_idle_sweep(self: Arc<Self>) {
        let sweep_scope = self.scope.child("idle-sweep", || async { Ok(()) });
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.idle_sweep_interval);
            loop {
                tokio::select! {
                    _ = sweep_scope.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let victims: Vec<Arc<PooledConnection>> = {
                    let conns = self.connections.read().await;
                    let floor = self.config.min_conns;
                    if conns.len() <= floor {
                        Vec::new()
                    } else {
                        let removable = conns.len() - floor;
                        conns
                            .iter()
                            .filter(|pc| pc.is_idle_past(self.config.max_idle_time))
                            .take(removable)
                            .cloned()
                            .collect()
                    }
                };

                debug!(peer = %self.peer_addr, considered = victims.len(), "node pool idle sweep pass");
                for pc in victims {
                    self.remove_connection(&pc).await;
                }
            }
        });
    }

    fn spawn_liveness(self: Arc<Self>) {
        let liveness_scope = self.scope.child("liveness", || async { Ok(()) });
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.liveness_interval);
            loop {
                tokio::select! {
                    _ = liveness_scope.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let snapshot: Vec<Arc<PooledConnection>> = self.connections.read().await.clone();
                for pc in snapshot {
                    if self.ping(&pc).await {
                        pc.missed_pongs.store(0, Ordering::SeqCst);
                        continue;
                    }
                    let missed = pc.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(peer = %self.peer_addr, missed, "node pool connection missed a liveness pong");
                    if missed >= self.config.max_missed_pongs {
                        warn!(peer = %self.peer_addr, "removing unresponsive node pool connection");
                        self.remove_connection(&pc).await;
                    }
                }
            }
        });
    }
}

/// Registry of one [`NodePool`] per peer node, keyed by peer address —
/// the shape the tunnel manager (C11) consults when a cross-node tunnel
/// needs a forward session to a node it hasn't talked to yet.
pub struct NodePoolRegistry {
    config: NodePoolConfig,
    scope: Scope,
    pools: RwLock<HashMap<SocketAddr, Arc<NodePool>>>,
}

impl NodePoolRegistry {
    pub fn new(config: NodePoolConfig, scope: Scope) -> Arc<Self> {
        Arc::new(Self {
            config,
            scope,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub async fn pool_for(&self, peer_addr: SocketAddr) -> NodePoolResult<Arc<NodePool>> {
        if let Some(pool) = self.pools.read().await.get(&peer_addr) {
            return Ok(pool.clone());
        }
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&peer_addr) {
            return Ok(pool.clone());
        }
        let pool = NodePool::new(peer_addr, self.config.clone(), &self.scope)?;
        pools.insert(peer_addr, pool.clone());
        Ok(pool)
    }
}
