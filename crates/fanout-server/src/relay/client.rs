use std::sync::Arc;
use tokio::net::TcpStream;

use super::SessionConn;
use super::link::{Link, RelayIo};
use crate::error::Result;

/// Dialed relay link to another node. Cheap to clone; every clone shares the
/// same connection.
#[derive(Clone)]
pub struct RelayClient {
    link: Arc<Link>,
}

impl RelayClient {
    pub async fn connect(addr: &str, node_id: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        tracing::info!("Connected relay link to {}", addr);

        Self::over(stream, node_id, addr.to_string()).await
    }

    /// Run the dialing side of a link over an existing byte stream
    pub async fn over(io: impl RelayIo, node_id: &str, peer: String) -> Result<Self> {
        let link = Link::dial(Box::new(io), node_id, peer).await?;
        Ok(Self { link })
    }

    /// Open a session on this link. The link is released when the last
    /// session opened on it closes.
    pub async fn open_session(&self, session_id: u32) -> Result<SessionConn> {
        self.link.open(session_id).await
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    pub fn peer(&self) -> &str {
        self.link.peer()
    }

    pub async fn close(&self) {
        self.link.shutdown().await;
    }
}

/// Dial `addr` and open `session_id` on a fresh link
pub async fn dial(addr: &str, session_id: u32, node_id: &str) -> Result<SessionConn> {
    let client = RelayClient::connect(addr, node_id).await?;
    client.open_session(session_id).await
}
