//! Source side of a tunnel (spec §4.11): this client owns the mapping's
//! `source_port` and dials the server fresh for every inbound connection or
//! UDP peer, opening one dedicated tunnel per app-side session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use tunnox_copy::{copy_bidirectional, copy_datagrams, DatagramEndpoint};
use tunnox_lifecycle::Scope;
use tunnox_proto::{CommandPacket, CommandType, ResponseBody, TransferPacket, TunnelOpenRequestBody};
use tunnox_stream::{PacketStream, Transformer};
use tunnox_transport::TransportAdapter;
use tunnox_transport_tcp::TcpAdapter;
use tunnox_store::{PortMapping, Protocol};

use crate::{build_transformer, Client, ClientError};

const UDP_PEER_CHANNEL_DEPTH: usize = 256;

/// Binds `mapping.source_port` and runs until `scope` closes. One call per
/// active source mapping, spawned and torn down by [`Client`]'s config
/// reconciliation.
pub async fn serve_source_mapping(
    client: Arc<Client>,
    mapping: PortMapping,
    scope: Scope,
) -> Result<(), ClientError> {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], mapping.source_port).into();
    match mapping.protocol {
        Protocol::Tcp => serve_tcp(client, mapping, scope, bind_addr).await,
        Protocol::Udp => serve_udp(client, mapping, scope, bind_addr).await,
    }
}

async fn serve_tcp(
    client: Arc<Client>,
    mapping: PortMapping,
    scope: Scope,
    bind_addr: SocketAddr,
) -> Result<(), ClientError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ClientError::CommandFailed(format!("bind {bind_addr} failed: {e}")))?;
    info!(port = mapping.source_port, mapping_id = %mapping.id, "source listener bound");

    loop {
        let (app_conn, peer_addr) = tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "source accept failed");
                    continue;
                }
            },
        };
        app_conn.set_nodelay(true).ok();
        debug!(%peer_addr, mapping_id = %mapping.id, "accepted source connection");

        let client = client.clone();
        let mapping = mapping.clone();
        let conn_scope = scope.child(format!("source-conn-{peer_addr}"), || async { Ok(()) });
        tokio::spawn(async move {
            if let Err(e) = run_stream_tunnel(client, mapping, app_conn, conn_scope).await {
                warn!(%peer_addr, error = %e, "source tunnel failed");
            }
        });
    }
}

/// One shared socket demultiplexed by peer address, mirroring
/// `tunnox-transport-udp`'s pattern but feeding a [`DatagramEndpoint`]
/// instead of a duplex-stream `ConnectionHandler` — tunnel data keeps its
/// own length-prefixed framing, so there is no byte-stream boundary problem
/// to hide from the copy engine here.
async fn serve_udp(
    client: Arc<Client>,
    mapping: PortMapping,
    scope: Scope,
    bind_addr: SocketAddr,
) -> Result<(), ClientError> {
    let socket = Arc::new(
        UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ClientError::CommandFailed(format!("bind {bind_addr} failed: {e}")))?,
    );
    info!(port = mapping.source_port, mapping_id = %mapping.id, "source udp socket bound");

    let peers: Arc<AsyncMutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> = Arc::new(AsyncMutex::new(HashMap::new()));
    let mut buf = vec![0u8; u16::MAX as usize];

    loop {
        let (n, peer_addr) = tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            recvd = socket.recv_from(&mut buf) => match recvd {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "source udp recv failed");
                    continue;
                }
            },
        };

        let existing_tx = peers.lock().await.get(&peer_addr).cloned();
        if let Some(tx) = existing_tx {
            if tx.send(buf[..n].to_vec()).await.is_err() {
                peers.lock().await.remove(&peer_addr);
            }
            continue;
        }

        debug!(%peer_addr, mapping_id = %mapping.id, "new udp peer, opening tunnel");
        let (tx, rx) = mpsc::channel(UDP_PEER_CHANNEL_DEPTH);
        peers.lock().await.insert(peer_addr, tx.clone());
        let _ = tx.send(buf[..n].to_vec()).await;

        let endpoint = PeerEndpoint {
            socket: socket.clone(),
            peer_addr,
            inbound: AsyncMutex::new(rx),
        };
        let client = client.clone();
        let mapping = mapping.clone();
        let conn_scope = scope.child(format!("source-udp-{peer_addr}"), || async { Ok(()) });
        let peers = peers.clone();
        tokio::spawn(async move {
            if let Err(e) = run_datagram_tunnel(client, mapping, endpoint, conn_scope).await {
                warn!(%peer_addr, error = %e, "source udp tunnel failed");
            }
            peers.lock().await.remove(&peer_addr);
        });
    }
}

/// A single UDP peer's view over the shared source socket: inbound
/// datagrams arrive over `inbound` (fed by `serve_udp`'s demux loop),
/// outbound ones go straight to the socket addressed at `peer_addr`.
struct PeerEndpoint {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    inbound: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl DatagramEndpoint for PeerEndpoint {
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "udp peer channel closed")),
        }
    }

    async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(buf, self.peer_addr).await
    }
}

async fn run_stream_tunnel(
    client: Arc<Client>,
    mapping: PortMapping,
    app_conn: TcpStream,
    scope: Scope,
) -> Result<(), ClientError> {
    let transformer = build_transformer(&mapping.transform)?;
    let raw = open_tunnel(&client, &mapping).await?;
    scope.add_cleanup(|| async { Ok(()) });
    let outcome = copy_bidirectional(app_conn, raw, transformer).await;
    debug!(mapping_id = %mapping.id, a_to_b = outcome.a_to_b.bytes, b_to_a = outcome.b_to_a.bytes, "source tunnel closed");
    Ok(())
}

async fn run_datagram_tunnel(
    client: Arc<Client>,
    mapping: PortMapping,
    endpoint: PeerEndpoint,
    scope: Scope,
) -> Result<(), ClientError> {
    let raw = open_tunnel(&client, &mapping).await?;
    scope.add_cleanup(|| async { Ok(()) });
    let outcome = copy_datagrams(Arc::new(endpoint), raw).await;
    debug!(
        mapping_id = %mapping.id,
        datagrams_up = outcome.udp_to_tunnel.datagrams,
        datagrams_down = outcome.tunnel_to_udp.datagrams,
        "source udp tunnel closed"
    );
    Ok(())
}

/// Dials a fresh connection to the server, performs the `TunnelOpenRequest`
/// handshake, and hands back the raw byte pipe the connection yields once
/// the server accepts it (spec §4.7: "the session yields its raw byte pipe
/// afterward").
async fn open_tunnel(
    client: &Arc<Client>,
    mapping: &PortMapping,
) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static, ClientError> {
    let adapter = TcpAdapter::new();
    let stream = adapter.dial(client.server_addr()).await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut packet_stream = PacketStream::new(read_half, write_half, Transformer::identity());

    let tunnel_id = uuid::Uuid::new_v4().to_string();
    let body = TunnelOpenRequestBody {
        tunnel_id: tunnel_id.clone(),
        mapping_id: mapping.id.clone(),
        secret_key: mapping.secret_key.clone(),
        protocol: mapping.protocol,
        target_host: mapping.target_host.clone(),
        target_port: mapping.target_port,
        enable_compression: mapping.transform.enable_compression,
        compression_level: mapping.transform.compression_level,
        enable_encryption: mapping.transform.enable_encryption,
        encryption_method: mapping.transform.encryption_method.clone(),
        encryption_key: mapping.transform.encryption_key.clone(),
    };
    let command = CommandPacket::new(
        CommandType::TunnelOpenRequest,
        tunnel_id.clone(),
        String::new(),
        client.client_id().await.unwrap_or(0),
        mapping.target_client_id,
        serde_json::to_value(&body).unwrap_or_default(),
    );
    packet_stream
        .write_packet(&TransferPacket::Command(command), true, None)
        .await?;

    match packet_stream.read_packet().await {
        Ok((TransferPacket::Command(reply), _)) if reply.command_type == CommandType::Response => {
            let response: ResponseBody = reply
                .decode_body()
                .map_err(|e| ClientError::CommandFailed(format!("malformed tunnel open reply: {e}")))?;
            if !response.success {
                return Err(ClientError::CommandFailed(response.error.unwrap_or_default()));
            }
        }
        Ok(_) => return Err(ClientError::CommandFailed("unexpected reply to tunnel open request".into())),
        Err(e) => return Err(ClientError::Stream(e)),
    }

    let (raw_reader, raw_writer) = packet_stream.into_halves();
    Ok(tokio::io::join(raw_reader, raw_writer))
}
