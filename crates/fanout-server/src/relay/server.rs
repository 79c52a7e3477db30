use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::SessionConn;
use super::link::{Link, RelayIo};
use crate::error::{Result, SfuError};

/// Accepts relay links from other nodes and hands out their sessions
pub struct RelayServer {
    local_addr: SocketAddr,
    accept_tx: mpsc::UnboundedSender<SessionConn>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<SessionConn>>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(listen(listener, accept_tx.clone(), shutdown.clone()));

        tracing::info!("Relay server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run a relay link over an already established byte stream
    pub async fn serve(&self, io: impl RelayIo, remote_addr: String) -> Result<()> {
        let link = Link::accept(Box::new(io), self.accept_tx.clone(), remote_addr).await?;
        tracing::info!("Relay link from {} established", link.peer());
        Ok(())
    }

    /// Wait for the next session opened by any connected peer
    pub async fn accept_session(&self) -> Result<SessionConn> {
        let mut accept_rx = self.accept_rx.lock().await;

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(SfuError::ListenerClosed),
            conn = accept_rx.recv() => conn.ok_or(SfuError::ListenerClosed),
        }
    }

    /// Stop accepting. Links that are already up keep running.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Closing relay server on {}", self.local_addr);
        }
        self.shutdown.cancel();
    }
}

async fn listen(
    listener: TcpListener,
    accept_tx: mpsc::UnboundedSender<SessionConn>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Error accepting relay connection: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let accept_tx = accept_tx.clone();
        tokio::spawn(async move {
            match Link::accept(Box::new(stream), accept_tx, addr.to_string()).await {
                Ok(link) => tracing::info!("Relay link from {} established", link.peer()),
                Err(e) => tracing::warn!("Relay handshake with {} failed: {}", addr, e),
            }
        });
    }

    tracing::info!("Relay listener stopped");
}
