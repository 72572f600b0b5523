//! Bridges a WebSocket connection to a plain byte pipe, so the rest of the
//! system can treat it like any other [`tunnox_transport::TransportStream`].
//!
//! Binary WebSocket messages carry raw tunnel bytes 1:1 (spec §4.6: "binary
//! message per payload"). A background task pumps bytes between the
//! WebSocket and one half of a `tokio::io::duplex` pipe; the other half is
//! handed back to the caller. The same task sends an application-level
//! ping on a fixed interval to keep intermediaries (load balancers,
//! proxies) from reaping an idle connection.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Interval between application-level pings (spec §4.6 default: 30s).
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the pump task and returns the caller-facing half of the bridge.
pub fn bridge(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> DuplexStream {
    let (caller_side, internal_side) = tokio::io::duplex(BUFFER_SIZE);
    let (mut internal_read, mut internal_write) = tokio::io::split(internal_side);
    let (mut ws_write, mut ws_read) = ws.split();

    tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await; // first tick fires immediately

        let mut read_buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                incoming = ws_read.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            if internal_write.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_write.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("websocket peer closed the connection");
                            break;
                        }
                        Some(Ok(Message::Text(_)) | Ok(Message::Frame(_))) => {
                            warn!("ignoring non-binary websocket message");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error");
                            break;
                        }
                    }
                }
                outgoing = internal_read.read(&mut read_buf) => {
                    match outgoing {
                        Ok(0) => break,
                        Ok(n) => {
                            if ws_write.send(Message::Binary(read_buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "internal pipe read error");
                            break;
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_write.close().await;
    });

    caller_side
}
