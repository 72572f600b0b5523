//! Target side of a tunnel (spec §4.11): the server pushes a
//! `TunnelOpenRequest` on the main control connection whenever this client
//! is the target of a mapping a source client just opened; this module
//! answers it on a brand new dedicated connection and dials the real
//! target.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use tunnox_copy::{copy_bidirectional, copy_datagrams};
use tunnox_proto::{
    CommandPacket, CommandType, ResponseBody, TransferPacket, TunnelOpenRequestBody, TunnelOpenResponseBody,
};
use tunnox_stream::{PacketStream, Transformer};
use tunnox_transport::TransportAdapter;
use tunnox_transport_tcp::TcpAdapter;
use tunnox_store::Protocol;

use crate::{build_transformer, Client, ClientError};

/// Spawned by [`Client::dispatch`] for every `TunnelOpenRequest` pushed on
/// the control connection. Failure here just drops the tunnel attempt —
/// there is no caller on this side to report back to, since the source
/// client is the one waiting on a response, and it gets that response from
/// the server's tunnel manager, not from this client.
pub async fn handle_tunnel_open_push(client: Arc<Client>, command: CommandPacket) {
    let body: TunnelOpenRequestBody = match command.decode_body() {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "malformed tunnel_open_request push, ignoring");
            return;
        }
    };

    if let Err(e) = run(client, body).await {
        warn!(error = %e, "target-side tunnel open failed");
    }
}

async fn run(client: Arc<Client>, body: TunnelOpenRequestBody) -> Result<(), ClientError> {
    let transform = tunnox_store::TransformConfig {
        enable_compression: body.enable_compression,
        compression_level: body.compression_level,
        enable_encryption: body.enable_encryption,
        encryption_method: body.encryption_method.clone(),
        encryption_key: body.encryption_key.clone(),
    };

    let raw = open_tunnel(&client, &body).await?;

    let target_addr = format!("{}:{}", body.target_host, body.target_port);
    match body.protocol {
        Protocol::Tcp => {
            let transformer = build_transformer(&transform)?;
            let target_conn = TcpStream::connect(&target_addr)
                .await
                .map_err(|e| ClientError::CommandFailed(format!("dial target {target_addr} failed: {e}")))?;
            target_conn.set_nodelay(true).ok();
            let outcome = copy_bidirectional(target_conn, raw, transformer).await;
            debug!(
                tunnel_id = %body.tunnel_id,
                a_to_b = outcome.a_to_b.bytes,
                b_to_a = outcome.b_to_a.bytes,
                "target tunnel closed"
            );
        }
        Protocol::Udp => {
            let target: SocketAddr = target_addr
                .parse()
                .map_err(|e| ClientError::CommandFailed(format!("invalid target address {target_addr}: {e}")))?;
            let socket = UdpSocket::bind(("0.0.0.0", 0))
                .await
                .map_err(|e| ClientError::CommandFailed(format!("udp bind failed: {e}")))?;
            socket
                .connect(target)
                .await
                .map_err(|e| ClientError::CommandFailed(format!("udp connect to {target} failed: {e}")))?;
            let outcome = copy_datagrams(Arc::new(socket), raw).await;
            debug!(
                tunnel_id = %body.tunnel_id,
                datagrams_up = outcome.udp_to_tunnel.datagrams,
                datagrams_down = outcome.tunnel_to_udp.datagrams,
                "target udp tunnel closed"
            );
        }
    }
    Ok(())
}

/// Dials a fresh connection to the server, answers the pending
/// `TunnelOpenRequest` with a `TunnelOpenResponse`, and returns the raw byte
/// pipe the connection yields once accepted.
async fn open_tunnel(
    client: &Arc<Client>,
    body: &TunnelOpenRequestBody,
) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static, ClientError> {
    let adapter = TcpAdapter::new();
    let stream = adapter.dial(client.server_addr()).await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut packet_stream = PacketStream::new(read_half, write_half, Transformer::identity());

    let response_body = TunnelOpenResponseBody {
        tunnel_id: body.tunnel_id.clone(),
    };
    let command = CommandPacket::new(
        CommandType::TunnelOpenResponse,
        body.tunnel_id.clone(),
        String::new(),
        client.client_id().await.unwrap_or(0),
        0,
        serde_json::to_value(&response_body).unwrap_or_default(),
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
        Ok(_) => return Err(ClientError::CommandFailed("unexpected reply to tunnel open response".into())),
        Err(e) => return Err(ClientError::Stream(e)),
    }

    let (raw_reader, raw_writer) = packet_stream.into_halves();
    Ok(tokio::io::join(raw_reader, raw_writer))
}
