//! QUIC adapter (spec §4.6): one `quinn::Connection` per peer; each new
//! bidirectional stream on that connection becomes its own packet stream,
//! handed to the session manager independently.

pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use tunnox_lifecycle::Scope;
use tunnox_transport::{ConnectionHandler, TransportAdapter, TransportError, TransportResult};

pub struct QuicAdapter {
    endpoint: RwLock<Option<quinn::Endpoint>>,
}

impl QuicAdapter {
    pub fn new() -> Self {
        Self {
            endpoint: RwLock::new(None),
        }
    }
}

impl Default for QuicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for QuicAdapter {
    async fn listen(&self, addr: SocketAddr) -> TransportResult<()> {
        let server_config = tls::server_config(vec!["localhost".to_string(), addr.ip().to_string()]);
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(addr)
            } else {
                TransportError::Io(e)
            }
        })?;
        info!(%addr, "quic adapter listening");
        *self.endpoint.write().await = Some(endpoint);
        Ok(())
    }

    async fn dial(&self, addr: SocketAddr) -> TransportResult<tunnox_transport::BoxedStream> {
        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(tls::client_config());

        let connection = endpoint
            .connect(addr, "localhost")
            .map_err(|e| TransportError::Handshake(e.to_string()))?
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        Ok(Box::new(tokio::io::join(recv, send)))
    }

    async fn accept_loop(
        &self,
        scope: Scope,
        handler: Arc<dyn ConnectionHandler>,
    ) -> TransportResult<()> {
        let endpoint = {
            let guard = self.endpoint.read().await;
            guard.clone().ok_or(TransportError::AlreadyClosed)?
        };

        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else { return Ok(()) };
                    let handler = handler.clone();
                    let scope = scope.clone();
                    tokio::spawn(async move {
                        match incoming.await {
                            Ok(connection) => handle_connection(connection, scope, handler).await,
                            Err(e) => warn!(error = %e, "quic handshake failed"),
                        }
                    });
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if let Some(endpoint) = self.endpoint.write().await.take() {
            endpoint.close(0u32.into(), b"adapter closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "quic"
    }
}

async fn handle_connection(connection: quinn::Connection, scope: Scope, handler: Arc<dyn ConnectionHandler>) {
    let remote_addr = connection.remote_address();
    debug!(%remote_addr, "quic connection established");

    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            accepted = connection.accept_bi() => {
                match accepted {
                    Ok((send, recv)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.accept_connection(Box::new(tokio::io::join(recv, send)), remote_addr).await;
                        });
                    }
                    Err(e) => {
                        debug!(%remote_addr, error = %e, "quic connection closed");
                        return;
                    }
                }
            }
        }
    }
}
