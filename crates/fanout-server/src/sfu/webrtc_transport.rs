use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::codec;
use super::media::{WebRtcReceiver, WebRtcSender};
use super::router::Router;
use super::session::Session;
use super::transport::Transport;
use crate::error::{Result, SfuError};
use crate::rtc::WebRtcApi;

type OfferHandler = Arc<dyn Fn(RTCSessionDescription) + Send + Sync>;

/// Transport for a browser or other WebRTC endpoint.
///
/// Every remote track becomes a router in the session. Streams published by
/// other transports are added as local tracks; when a track is added after
/// the initial answer a new offer is produced for the remote end.
pub struct WebRtcTransport {
    id: String,
    session: Arc<Session>,
    pc: Arc<RTCPeerConnection>,
    /// SSRC -> router for each remote track
    published: Mutex<HashMap<u32, Arc<Router>>>,
    /// SSRC -> router this peer receives
    subscriptions: Mutex<HashMap<u32, Arc<Router>>>,
    on_offer: Mutex<Option<OfferHandler>>,
    pending_offer: Mutex<Option<RTCSessionDescription>>,
    negotiation: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    /// Create the peer connection and apply the remote `offer`. The
    /// transport is not part of `session` until it is added there.
    pub async fn new(
        session: Arc<Session>,
        api: &WebRtcApi,
        offer: RTCSessionDescription,
    ) -> Result<Arc<Self>> {
        let pc = Arc::new(api.new_peer_connection().await?);

        let transport = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            session,
            pc: pc.clone(),
            published: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            on_offer: Mutex::new(None),
            pending_offer: Mutex::new(None),
            negotiation: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&transport);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(transport) = weak.upgrade() {
                    transport.publish(track).await;
                }
            })
        }));

        let weak = Arc::downgrade(&transport);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                tracing::info!("Transport {} connection state: {}", transport.id, state);

                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    tokio::spawn(async move {
                        if let Err(e) = transport.close().await {
                            tracing::warn!("Error closing transport {}: {}", transport.id, e);
                        }
                    });
                }
            })
        }));

        if let Err(e) = pc.set_remote_description(offer).await {
            transport.closed.store(true, Ordering::SeqCst);
            let _ = pc.close().await;
            return Err(e.into());
        }

        tracing::info!(
            "Created WebRTC transport {} for session {}",
            transport.id,
            transport.session.id()
        );

        Ok(transport)
    }

    /// Create the answer to the offer given to [`WebRtcTransport::new`]. Waits
    /// for ICE gathering so the answer carries every candidate.
    pub async fn answer(&self) -> Result<RTCSessionDescription> {
        let _negotiation = self.negotiation.lock().await;

        let answer = self.pc.create_answer(None).await?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer.clone()).await?;
        let _ = gather_complete.recv().await;

        Ok(self.pc.local_description().await.unwrap_or(answer))
    }

    /// Deliver renegotiation offers to `handler` instead of holding them for
    /// [`Transport::pending_offer`]
    pub fn on_offer<F>(&self, handler: F)
    where
        F: Fn(RTCSessionDescription) + Send + Sync + 'static,
    {
        *self.on_offer.lock() = Some(Arc::new(handler));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn publish(self: &Arc<Self>, track: Arc<TrackRemote>) {
        if self.is_closed() {
            return;
        }

        let ssrc = track.ssrc();
        tracing::info!(
            "Transport {} publishing {} track {} (pt {})",
            self.id,
            track.kind(),
            ssrc,
            track.payload_type()
        );

        let router = Router::new(Arc::new(WebRtcReceiver::new(track)), self.id.clone());
        let replaced = self.published.lock().insert(ssrc, router.clone());
        if let Some(old) = replaced {
            old.close().await;
        }

        router.start_forwarding();
        self.session.add_router(router).await;
    }

    async fn renegotiate(&self) -> Result<()> {
        let _negotiation = self.negotiation.lock().await;

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        let handler = self.on_offer.lock().clone();
        match handler {
            Some(handler) => handler(offer),
            None => *self.pending_offer.lock() = Some(offer),
        }

        tracing::info!("Transport {} created renegotiation offer", self.id);
        Ok(())
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, router: Arc<Router>, renegotiate: bool) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::ChannelClosed);
        }

        let ssrc = router.ssrc();
        let codec = codec::capability_for(router.publisher().payload_type())
            .ok_or(SfuError::PayloadTypeUnsupported)?;

        {
            let mut subscriptions = self.subscriptions.lock();
            if let Some(current) = subscriptions.get(&ssrc) {
                if Arc::ptr_eq(current, &router) && !current.is_closed() {
                    return Ok(());
                }
            }
            subscriptions.insert(ssrc, router.clone());
        }

        let result = self.attach(&router, codec).await;
        if let Err(e) = result {
            self.subscriptions.lock().remove(&ssrc);
            return Err(e);
        }

        if renegotiate {
            self.renegotiate().await?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(
            "Closing WebRTC transport {} in session {}",
            self.id,
            self.session.id()
        );

        let published: Vec<Arc<Router>> = self.published.lock().drain().map(|(_, r)| r).collect();
        for router in published {
            router.close().await;
        }

        let subscriptions: Vec<Arc<Router>> =
            self.subscriptions.lock().drain().map(|(_, r)| r).collect();
        for router in subscriptions {
            router.remove_sub(&self.id).await;
        }

        self.session.remove_transport(&self.id).await;
        self.pc.close().await?;

        Ok(())
    }

    async fn stats(&self) -> String {
        let published = self.published.lock().len();
        let subscribed = self.subscriptions.lock().len();
        format!(
            "    transport: {} | webrtc {} | published: {} subscribed: {}\n",
            self.id,
            self.pc.connection_state(),
            published,
            subscribed
        )
    }

    async fn set_remote_description(&self, answer: RTCSessionDescription) -> Result<()> {
        let _negotiation = self.negotiation.lock().await;
        self.pc.set_remote_description(answer).await?;
        tracing::debug!("Transport {} applied renegotiation answer", self.id);
        Ok(())
    }

    async fn pending_offer(&self) -> Result<Option<RTCSessionDescription>> {
        Ok(self.pending_offer.lock().take())
    }
}

impl WebRtcTransport {
    /// Add a local track for `router` and register it as a subscriber
    async fn attach(
        &self,
        router: &Arc<Router>,
        codec: webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    ) -> Result<()> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec,
            format!("{}-{}", router.ssrc(), self.id),
            format!("stream-{}", router.publisher_id()),
        ));

        let rtp_sender = self.pc.add_track(track.clone()).await?;

        // RTCP has to be read for interceptors like NACK to work
        let rtcp_reader = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_reader.read(&mut buf).await {}
        });

        router
            .add_sub(self.id.clone(), Arc::new(WebRtcSender::new(track, rtp_sender)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::sfu::testing::MockReceiver;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    async fn client_offer(api: &WebRtcApi) -> (RTCPeerConnection, RTCSessionDescription) {
        let client = api.new_peer_connection().await.unwrap();
        client
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .unwrap();

        let offer = client.create_offer(None).await.unwrap();
        let mut gather_complete = client.gathering_complete_promise().await;
        client.set_local_description(offer).await.unwrap();
        let _ = gather_complete.recv().await;
        let offer = client.local_description().await.unwrap();

        (client, offer)
    }

    async fn setup() -> (Arc<Session>, WebRtcApi, RTCPeerConnection, Arc<WebRtcTransport>) {
        let api = WebRtcApi::new(&WebRtcConfig::default()).unwrap();
        let (client, offer) = client_offer(&api).await;
        let session = Session::new(1);
        let transport = WebRtcTransport::new(session.clone(), &api, offer).await.unwrap();
        session.add_transport(transport.clone()).await.unwrap();
        (session, api, client, transport)
    }

    #[tokio::test]
    async fn test_answer_from_offer() {
        let (_session, _api, client, transport) = setup().await;

        let answer = transport.answer().await.unwrap();
        assert_eq!(answer.sdp_type, RTCSdpType::Answer);
        let parsed = answer.unmarshal().unwrap();
        assert!(!parsed.media_descriptions.is_empty());

        client.set_remote_description(answer).await.unwrap();
        transport.close().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_adds_track_and_renegotiates() {
        let (_session, _api, client, transport) = setup().await;
        transport.answer().await.unwrap();

        let router = Router::new(MockReceiver::new(4242), "publisher");
        transport.subscribe(router.clone(), true).await.unwrap();
        transport.subscribe(router.clone(), true).await.unwrap();
        assert_eq!(router.subscriber_count().await, 1);

        let offer = transport.pending_offer().await.unwrap().unwrap();
        assert!(offer.sdp.contains("opus"));
        assert!(transport.pending_offer().await.unwrap().is_none());

        transport.close().await.unwrap();
        assert_eq!(router.subscriber_count().await, 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_payload_type_is_rejected() {
        let (_session, _api, client, transport) = setup().await;

        let router = Router::new(MockReceiver::with_payload_type(1, 0), "publisher");
        assert!(matches!(
            transport.subscribe(router.clone(), false).await,
            Err(SfuError::PayloadTypeUnsupported)
        ));
        assert_eq!(router.subscriber_count().await, 0);

        transport.close().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_leaves_session() {
        let (session, _api, client, transport) = setup().await;

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(session.is_closed());
        assert!(session.transport(transport.id()).await.is_none());
        client.close().await.unwrap();
    }
}
