//! SFU (Selective Forwarding Unit)
//!
//! Every published stream gets a router that forwards its RTP packets to the
//! other transports of the same session without any transcoding. Transports
//! are WebRTC peers or relay links to other nodes.

pub mod codec;
pub mod media;
mod registry;
mod relay_transport;
mod router;
mod session;
mod transport;
mod webrtc_transport;

#[cfg(test)]
pub(crate) mod testing;

pub use registry::SessionRegistry;
pub use relay_transport::{RelayReceiver, RelaySender, RelayTransport};
pub use router::Router;
pub use session::Session;
pub use transport::Transport;
pub use webrtc_transport::WebRtcTransport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::FanoutConfig;
use crate::error::{Result, SfuError};
use crate::relay::{RelayClient, RelayServer, SessionConn};
use crate::rtc::WebRtcApi;

/// One SFU node: the session registry, the WebRTC API and the relay
/// listener plus dialed relay links to other nodes
pub struct Sfu {
    config: FanoutConfig,
    webrtc: WebRtcApi,
    registry: Arc<SessionRegistry>,
    relay: Option<Arc<RelayServer>>,
    /// Dialed relay links by peer address
    clients: Mutex<HashMap<String, RelayClient>>,
    shutdown: CancellationToken,
}

impl Sfu {
    /// Build the node and bind the relay listener when `relay.port` is set
    pub async fn new(config: FanoutConfig) -> Result<Arc<Self>> {
        let relay = if config.relay.port != 0 {
            Some(RelayServer::bind(("0.0.0.0", config.relay.port)).await?)
        } else {
            None
        };

        Self::with_relay(config, relay)
    }

    /// Build the node around an already bound relay listener
    pub fn with_relay(config: FanoutConfig, relay: Option<RelayServer>) -> Result<Arc<Self>> {
        let webrtc = WebRtcApi::new(&config.webrtc)?;
        let registry = SessionRegistry::new(config.stats.max_listed_subscribers);
        let relay = relay.map(Arc::new);
        let shutdown = CancellationToken::new();

        if let Some(relay) = &relay {
            tokio::spawn(accept_loop(relay.clone(), registry.clone(), shutdown.clone()));
        }

        tokio::spawn(stats_loop(
            registry.clone(),
            config.stats.interval(),
            shutdown.clone(),
        ));

        tracing::info!(
            "SFU node {} started (relay: {})",
            config.relay.node_id,
            relay
                .as_ref()
                .map(|r| r.local_addr().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        Ok(Arc::new(Self {
            config,
            webrtc,
            registry,
            relay,
            clients: Mutex::new(HashMap::new()),
            shutdown,
        }))
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn webrtc(&self) -> &WebRtcApi {
        &self.webrtc
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Address of the relay listener, if enabled
    pub fn relay_addr(&self) -> Option<std::net::SocketAddr> {
        self.relay.as_ref().map(|relay| relay.local_addr())
    }

    /// The open session for `id`, created if needed
    pub fn new_session(&self, id: u32) -> Arc<Session> {
        self.registry.get_or_create(id)
    }

    pub fn get_session(&self, id: u32) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    /// Join `session_id` with a WebRTC peer. Returns the transport and the
    /// answer to send back to the peer.
    pub async fn new_webrtc_transport(
        &self,
        session_id: u32,
        offer: RTCSessionDescription,
    ) -> Result<(Arc<WebRtcTransport>, RTCSessionDescription)> {
        let api = &self.webrtc;
        let transport = self
            .registry
            .join(session_id, |session| {
                let offer = offer.clone();
                async move {
                    let transport = match WebRtcTransport::new(session.clone(), api, offer).await {
                        Ok(transport) => transport,
                        Err(e) => {
                            // Don't leave a session nobody joined behind
                            session.close_if_empty().await;
                            return Err(e);
                        }
                    };

                    if let Err(e) = session.add_transport(transport.clone()).await {
                        let _ = transport.close().await;
                        return Err(e);
                    }
                    Ok(transport)
                }
            })
            .await?;

        match transport.answer().await {
            Ok(answer) => Ok((transport, answer)),
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    /// Forward `session_id` to the node at `addr` over a shared relay link
    pub async fn new_relay_transport(
        &self,
        session_id: u32,
        addr: &str,
    ) -> Result<Arc<RelayTransport>> {
        let conn = self.open_relay_session(session_id, addr).await?;
        join_relay(&self.registry, conn).await
    }

    async fn open_relay_session(&self, session_id: u32, addr: &str) -> Result<SessionConn> {
        let client = self.relay_client(addr, false).await?;
        match client.open_session(session_id).await {
            // The cached link went down between lookup and open
            Err(SfuError::RelaySessionClosed(_)) | Err(SfuError::Io(_)) => {
                tracing::info!("Redialing relay link to {}", addr);
                let client = self.relay_client(addr, true).await?;
                client.open_session(session_id).await
            }
            opened => opened,
        }
    }

    async fn relay_client(&self, addr: &str, redial: bool) -> Result<RelayClient> {
        if !redial {
            if let Some(client) = self.clients.lock().await.get(addr) {
                if !client.is_closed() {
                    return Ok(client.clone());
                }
            }
        }

        let client = RelayClient::connect(addr, &self.config.relay.node_id).await?;

        let mut clients = self.clients.lock().await;
        if !redial {
            if let Some(existing) = clients.get(addr) {
                if !existing.is_closed() {
                    let existing = existing.clone();
                    drop(clients);
                    client.close().await;
                    return Ok(existing);
                }
            }
        }
        clients.insert(addr.to_string(), client.clone());

        Ok(client)
    }

    /// One diagnostic report for every live session
    pub async fn stats_report(&self) -> Option<String> {
        self.registry.stats().await
    }

    /// Stop the relay listener and background tasks. Sessions drain on
    /// their own as their transports leave.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(relay) = &self.relay {
            relay.close();
        }
        tracing::info!("SFU node {} closed", self.config.relay.node_id);
    }
}

async fn accept_loop(
    relay: Arc<RelayServer>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = relay.accept_session() => match accepted {
                Ok(conn) => conn,
                Err(SfuError::ListenerClosed) => break,
                Err(e) => {
                    tracing::warn!("Error accepting relay session: {}", e);
                    continue;
                }
            },
        };

        let session_id = conn.id();
        let peer = conn.peer().to_string();

        match join_relay(&registry, conn).await {
            Ok(transport) => tracing::info!(
                "Accepted relay transport {} for session {} from {}",
                transport.id(),
                session_id,
                peer
            ),
            Err(e) => tracing::error!(
                "Failed to create relay transport for session {} from {}: {}",
                session_id,
                peer,
                e
            ),
        }
    }

    tracing::info!("Relay accept loop stopped");
}

/// Attach a relay session to its local session, retrying with a fresh
/// session when the current one closes first. The conn is closed on failure.
async fn join_relay(registry: &Arc<SessionRegistry>, conn: SessionConn) -> Result<Arc<RelayTransport>> {
    let session_id = conn.id();
    let conn = Arc::new(conn);

    let joined = registry
        .join(session_id, |session| RelayTransport::attach(session, conn.clone()))
        .await;
    if joined.is_err() {
        let _ = conn.close().await;
    }
    joined
}

async fn stats_loop(registry: Arc<SessionRegistry>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Some(report) = registry.stats().await {
            tracing::info!("\n----------------stats-----------------\n{}", report);
        }
    }
}
