//! Transport that carries RTP between two nodes over a relay session.
//!
//! Each relay payload is one marshalled RTP packet. Streams arriving from the
//! peer are published into the local session; streams subscribed locally are
//! written back to the peer on the same session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::util::{Marshal, Unmarshal};

use super::media::{Receiver, Sender, TrackStats};
use super::router::Router;
use super::session::Session;
use super::transport::Transport;
use crate::error::{Result, SfuError};
use crate::relay::SessionConn;

/// Publisher fed by packets read from a relay session
pub struct RelayReceiver {
    ssrc: u32,
    payload_type: u8,
    tx: mpsc::UnboundedSender<RtpPacket>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RtpPacket>>,
    closed: CancellationToken,
    stats: TrackStats,
}

impl RelayReceiver {
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ssrc,
            payload_type,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            stats: TrackStats::default(),
        }
    }

    /// Queue a packet for the router. Fails once the receiver is closed.
    pub fn push(&self, packet: RtpPacket) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::ReceiverClosed);
        }
        self.tx.send(packet).map_err(|_| SfuError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Receiver for RelayReceiver {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    async fn read_rtp(&self) -> Result<RtpPacket> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SfuError::ReceiverClosed),
            packet = rx.recv() => {
                let packet = packet.ok_or(SfuError::ReceiverClosed)?;
                self.stats.record(&packet);
                Ok(packet)
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn stats(&self) -> String {
        format!("relay {}", self.stats)
    }
}

/// Subscriber that writes RTP to a relay session
pub struct RelaySender {
    conn: Arc<SessionConn>,
    closed: AtomicBool,
    stats: TrackStats,
}

impl RelaySender {
    pub fn new(conn: Arc<SessionConn>) -> Self {
        Self {
            conn,
            closed: AtomicBool::new(false),
            stats: TrackStats::default(),
        }
    }
}

#[async_trait]
impl Sender for RelaySender {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SfuError::ChannelClosed);
        }

        let raw = packet.marshal()?;
        self.conn.write(&raw).await?;
        self.stats.record(packet);

        Ok(())
    }

    // The session connection belongs to the transport and outlives senders
    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn stats(&self) -> String {
        format!("relay {}", self.stats)
    }
}

struct Published {
    receiver: Arc<RelayReceiver>,
    router: Arc<Router>,
}

pub struct RelayTransport {
    id: String,
    session: Arc<Session>,
    conn: Arc<SessionConn>,
    /// SSRC -> stream published from the peer
    published: Mutex<HashMap<u32, Published>>,
    /// SSRC -> router this transport is subscribed to
    subscriptions: Mutex<HashMap<u32, Arc<Router>>>,
    closed: AtomicBool,
}

impl RelayTransport {
    /// Join `session` with a relay session connection and start reading
    /// streams from the peer
    pub async fn new(session: Arc<Session>, conn: SessionConn) -> Result<Arc<Self>> {
        let conn = Arc::new(conn);
        let joined = Self::attach(session, conn.clone()).await;
        if joined.is_err() {
            let _ = conn.close().await;
        }
        joined
    }

    /// Like [`RelayTransport::new`], but a failed join leaves `conn` open so
    /// it can be attached to another session
    pub async fn attach(session: Arc<Session>, conn: Arc<SessionConn>) -> Result<Arc<Self>> {
        let transport = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            session: session.clone(),
            conn,
            published: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = session.add_transport(transport.clone()).await {
            transport.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }

        tracing::info!(
            "Relay transport {} joined session {} via {}",
            transport.id,
            session.id(),
            transport.conn.peer()
        );

        tokio::spawn(transport.clone().read_loop());

        Ok(transport)
    }

    pub fn session_id(&self) -> u32 {
        self.conn.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let payload = match self.conn.recv().await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::info!("Relay transport {} stopped reading: {}", self.id, e);
                    break;
                }
            };

            let mut buf = payload;
            let packet = match RtpPacket::unmarshal(&mut buf) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!("Dropping unparseable RTP on relay transport {}: {}", self.id, e);
                    continue;
                }
            };

            self.dispatch(packet).await;
        }

        if let Err(e) = self.close().await {
            tracing::warn!("Error closing relay transport {}: {}", self.id, e);
        }
    }

    async fn dispatch(self: &Arc<Self>, packet: RtpPacket) {
        let ssrc = packet.header.ssrc;

        let existing = self
            .published
            .lock()
            .get(&ssrc)
            .filter(|published| !published.receiver.is_closed())
            .map(|published| published.receiver.clone());

        let receiver = match existing {
            Some(receiver) => receiver,
            None => match self.publish(ssrc, packet.header.payload_type).await {
                Some(receiver) => receiver,
                None => return,
            },
        };

        if let Err(e) = receiver.push(packet) {
            tracing::debug!("Dropped packet for stream {} on {}: {}", ssrc, self.id, e);
        }
    }

    /// Create a router for a stream the peer started sending
    async fn publish(self: &Arc<Self>, ssrc: u32, payload_type: u8) -> Option<Arc<RelayReceiver>> {
        if self.is_closed() {
            return None;
        }

        let receiver = Arc::new(RelayReceiver::new(ssrc, payload_type));
        let router = Router::new(receiver.clone(), self.id.clone());

        self.published.lock().insert(
            ssrc,
            Published {
                receiver: receiver.clone(),
                router: router.clone(),
            },
        );

        tracing::info!(
            "Relay transport {} publishing stream {} (pt {}) into session {}",
            self.id,
            ssrc,
            payload_type,
            self.session.id()
        );

        router.start_forwarding();
        self.session.add_router(router).await;

        Some(receiver)
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, router: Arc<Router>, _renegotiate: bool) -> Result<()> {
        if self.is_closed() || self.conn.is_closed() {
            return Err(SfuError::RelaySessionClosed(self.conn.id()));
        }

        let ssrc = router.ssrc();
        {
            let mut subscriptions = self.subscriptions.lock();
            if let Some(current) = subscriptions.get(&ssrc) {
                if Arc::ptr_eq(current, &router) && !current.is_closed() {
                    return Ok(());
                }
            }
            subscriptions.insert(ssrc, router.clone());
        }

        let sender = Arc::new(RelaySender::new(self.conn.clone()));
        if let Err(e) = router.add_sub(self.id.clone(), sender).await {
            self.subscriptions.lock().remove(&ssrc);
            return Err(e);
        }

        tracing::debug!("Relay transport {} subscribed to stream {}", self.id, ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Closing relay transport {} in session {}", self.id, self.session.id());

        let published: Vec<Arc<Router>> = self
            .published
            .lock()
            .drain()
            .map(|(_, published)| published.router)
            .collect();
        for router in published {
            router.close().await;
        }

        let subscriptions: Vec<Arc<Router>> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(_, router)| router)
            .collect();
        for router in subscriptions {
            router.remove_sub(&self.id).await;
        }

        self.session.remove_transport(&self.id).await;
        self.conn.close().await
    }

    async fn stats(&self) -> String {
        let published = self.published.lock().len();
        let subscribed = self.subscriptions.lock().len();
        format!(
            "    transport: {} | relay {} session {} | published: {} subscribed: {}\n",
            self.id,
            self.conn.peer(),
            self.conn.id(),
            published,
            subscribed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayServer, dial};
    use crate::sfu::testing::{MockReceiver, MockSender, MockTransport, rtp_packet};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn relay_pair(session_id: u32) -> (SessionConn, SessionConn) {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let local = dial(&addr, session_id, "node-a").await.unwrap();
        let remote = timeout(Duration::from_secs(2), server.accept_session())
            .await
            .unwrap()
            .unwrap();
        (local, remote)
    }

    async fn wait_for_router(session: &Session, ssrc: u32) -> Arc<Router> {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(router) = session.router(ssrc).await {
                    return router;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_relay_sender_receiver() {
        let (local, remote) = relay_pair(3).await;
        let sender = RelaySender::new(Arc::new(local));

        sender.write_rtp(&rtp_packet(900, 12)).await.unwrap();

        let payload = remote.recv().await.unwrap();
        let mut buf = payload;
        let packet = RtpPacket::unmarshal(&mut buf).unwrap();
        assert_eq!(packet.header.ssrc, 900);
        assert_eq!(packet.header.sequence_number, 12);

        sender.close().await;
        assert!(matches!(
            sender.write_rtp(&rtp_packet(900, 13)).await,
            Err(SfuError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_incoming_stream_is_published_into_session() {
        let (local, remote) = relay_pair(4).await;

        let session = Session::new(4);
        let viewer = MockTransport::new("viewer");
        session.add_transport(viewer.clone()).await.unwrap();

        let transport = RelayTransport::new(session.clone(), remote).await.unwrap();

        let raw = rtp_packet(555, 1).marshal().unwrap();
        local.write(&raw).await.unwrap();

        let router = wait_for_router(&session, 555).await;
        assert_eq!(router.publisher_id(), transport.id());
        timeout(Duration::from_secs(2), async {
            while viewer.subscriptions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(viewer.subscriptions(), vec![(555, true)]);

        // Garbage is skipped, the stream keeps flowing
        local.write(&[0x01]).await.unwrap();
        local.write(&rtp_packet(555, 2).marshal().unwrap()).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while router.forwarded() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscribed_stream_is_written_to_peer() {
        let (local, remote) = relay_pair(6).await;

        let session = Session::new(6);
        let transport = RelayTransport::new(session.clone(), remote).await.unwrap();

        let publisher = MockReceiver::new(321);
        let router = Router::new(publisher.clone(), "webrtc-publisher");
        transport.subscribe(router.clone(), true).await.unwrap();
        transport.subscribe(router.clone(), false).await.unwrap();
        assert_eq!(router.subscriber_count().await, 1);

        router.forward_packet(&rtp_packet(321, 77)).await;

        let mut buf = timeout(Duration::from_secs(2), local.recv())
            .await
            .unwrap()
            .unwrap();
        let packet = RtpPacket::unmarshal(&mut buf).unwrap();
        assert_eq!(packet.header.sequence_number, 77);
    }

    #[tokio::test]
    async fn test_failed_attach_keeps_conn_for_retry() {
        let (local, remote) = relay_pair(9).await;
        let remote = Arc::new(remote);

        let closed = Session::new(9);
        closed.add_transport(MockTransport::new("gone")).await.unwrap();
        closed.remove_transport("gone").await;

        assert!(matches!(
            RelayTransport::attach(closed, remote.clone()).await,
            Err(SfuError::SessionClosed(9))
        ));
        assert!(!remote.is_closed());

        let session = Session::new(9);
        let transport = RelayTransport::attach(session.clone(), remote).await.unwrap();
        local.write(&rtp_packet(12, 1).marshal().unwrap()).await.unwrap();
        let router = wait_for_router(&session, 12).await;
        assert_eq!(router.publisher_id(), transport.id());
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_transport() {
        let (local, remote) = relay_pair(8).await;

        let session = Session::new(8);
        let transport = RelayTransport::new(session.clone(), remote).await.unwrap();

        local.write(&rtp_packet(10, 1).marshal().unwrap()).await.unwrap();
        let router = wait_for_router(&session, 10).await;

        let watcher = MockSender::new();
        router.add_sub("watcher", watcher.clone()).await.unwrap();

        local.close().await.unwrap();

        timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(router.is_closed());
        assert!(transport.is_closed());
        assert_eq!(watcher.close_count(), 1);
    }
}
