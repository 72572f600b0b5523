//! WebSocket adapter: HTTP upgrade, binary framing, then bridged to a plain
//! byte pipe (spec §4.6).

pub mod bridge;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};

use tunnox_lifecycle::Scope;
use tunnox_transport::{
    ConnectionHandler, TransportAdapter, TransportError, TransportResult, ACCEPT_POLL_INTERVAL_MS,
};

pub struct WebSocketAdapter {
    listener: RwLock<Option<TcpListener>>,
}

impl WebSocketAdapter {
    pub fn new() -> Self {
        Self {
            listener: RwLock::new(None),
        }
    }
}

impl Default for WebSocketAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for WebSocketAdapter {
    async fn listen(&self, addr: SocketAddr) -> TransportResult<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(addr)
            } else {
                TransportError::Io(e)
            }
        })?;
        info!(%addr, "websocket adapter listening");
        *self.listener.write().await = Some(listener);
        Ok(())
    }

    async fn dial(&self, addr: SocketAddr) -> TransportResult<tunnox_transport::BoxedStream> {
        let url = format!("ws://{addr}/");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(bridge::bridge(ws_stream)))
    }

    async fn accept_loop(
        &self,
        scope: Scope,
        handler: Arc<dyn ConnectionHandler>,
    ) -> TransportResult<()> {
        loop {
            if scope.is_closed() {
                return Ok(());
            }

            let accept_result = {
                let guard = self.listener.read().await;
                let listener = guard.as_ref().ok_or(TransportError::AlreadyClosed)?;
                timeout(Duration::from_millis(ACCEPT_POLL_INTERVAL_MS), listener.accept()).await
            };

            match accept_result {
                Ok(Ok((tcp_stream, remote_addr))) => {
                    tcp_stream.set_nodelay(true).ok();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(MaybeTlsStream::Plain(tcp_stream)).await {
                            Ok(ws_stream) => {
                                debug!(%remote_addr, "websocket handshake complete");
                                let stream = bridge::bridge(ws_stream);
                                handler.accept_connection(Box::new(stream), remote_addr).await;
                            }
                            Err(e) => {
                                warn!(%remote_addr, error = %e, "websocket handshake failed");
                            }
                        }
                    });
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "websocket accept failed");
                }
                Err(_elapsed) => {}
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        *self.listener.write().await = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionHandler for CountingHandler {
        async fn accept_connection(
            &self,
            mut stream: tunnox_transport::BoxedStream,
            _remote_addr: SocketAddr,
        ) {
            self.count.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
            }
        }
    }

    #[tokio::test]
    async fn echoes_binary_payload_over_a_dialed_connection() {
        let adapter = Arc::new(WebSocketAdapter::new());
        adapter.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let bound_addr = {
            let guard = adapter.listener.read().await;
            guard.as_ref().unwrap().local_addr().unwrap()
        };

        let scope = Scope::new("ws-test");
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { count: count.clone() });

        let adapter_clone = adapter.clone();
        let scope_clone = scope.clone();
        let accept_task = tokio::spawn(async move {
            adapter_clone.accept_loop(scope_clone, handler).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut client = adapter.dial(bound_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scope.close().await;
        let _ = tokio::time::timeout(Duration::from_millis(300), accept_task).await;
    }
}
