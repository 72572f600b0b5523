//! Plain TCP adapter (spec §4.6).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use tunnox_lifecycle::Scope;
use tunnox_transport::{
    ConnectionHandler, TransportAdapter, TransportError, TransportResult, ACCEPT_POLL_INTERVAL_MS,
};

pub struct TcpAdapter {
    listener: RwLock<Option<TcpListener>>,
}

impl TcpAdapter {
    pub fn new() -> Self {
        Self {
            listener: RwLock::new(None),
        }
    }
}

impl Default for TcpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for TcpAdapter {
    async fn listen(&self, addr: SocketAddr) -> TransportResult<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(addr)
            } else {
                TransportError::Io(e)
            }
        })?;
        info!(%addr, "tcp adapter listening");
        *self.listener.write().await = Some(listener);
        Ok(())
    }

    async fn dial(&self, addr: SocketAddr) -> TransportResult<tunnox_transport::BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
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
                Ok(Ok((stream, remote_addr))) => {
                    stream.set_nodelay(true).ok();
                    debug!(%remote_addr, "tcp connection accepted");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.accept_connection(Box::new(stream), remote_addr).await;
                    });
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "tcp accept failed");
                }
                Err(_elapsed) => {
                    // Poll timeout; loop back around to re-check cancellation.
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        *self.listener.write().await = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
