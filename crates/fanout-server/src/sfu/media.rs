//! Publisher and subscriber capabilities the router works against.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Result, SfuError};

/// Source of one published stream
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Stream identifier
    fn ssrc(&self) -> u32;

    fn payload_type(&self) -> u8;

    /// Next packet from the publisher. Fails with
    /// [`SfuError::ReceiverClosed`] once the stream has ended.
    async fn read_rtp(&self) -> Result<RtpPacket>;

    fn close(&self);

    fn stats(&self) -> String;
}

/// Destination for forwarded packets of one subscriber
#[async_trait]
pub trait Sender: Send + Sync {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()>;

    async fn close(&self);

    fn stats(&self) -> String;
}

/// Packet and byte counters
#[derive(Debug, Default)]
pub struct TrackStats {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl TrackStats {
    pub fn record(&self, packet: &RtpPacket) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Display for TrackStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packets: {} bytes: {}", self.packets(), self.bytes())
    }
}

/// Publisher backed by a remote WebRTC track
pub struct WebRtcReceiver {
    track: Arc<TrackRemote>,
    closed: CancellationToken,
    stats: TrackStats,
}

impl WebRtcReceiver {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self {
            track,
            closed: CancellationToken::new(),
            stats: TrackStats::default(),
        }
    }
}

#[async_trait]
impl Receiver for WebRtcReceiver {
    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn payload_type(&self) -> u8 {
        self.track.payload_type()
    }

    async fn read_rtp(&self) -> Result<RtpPacket> {
        loop {
            let read = tokio::select! {
                _ = self.closed.cancelled() => return Err(SfuError::ReceiverClosed),
                read = self.track.read_rtp() => read,
            };

            match read {
                Ok((packet, _attributes)) => {
                    self.stats.record(&packet);
                    return Ok(packet);
                }
                Err(e) => {
                    // The RTPReceiver is attached shortly after the track
                    // fires, and is swapped during renegotiation
                    if e.to_string().contains("RTPReceiver must not be nil") {
                        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                        continue;
                    }
                    tracing::debug!("Remote track {} ended: {}", self.track.ssrc(), e);
                    self.closed.cancel();
                    return Err(SfuError::ReceiverClosed);
                }
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn stats(&self) -> String {
        format!("webrtc {} {}", self.track.kind(), self.stats)
    }
}

/// Subscriber backed by a local WebRTC track on the subscriber's peer
/// connection
pub struct WebRtcSender {
    track: Arc<TrackLocalStaticRTP>,
    rtp_sender: Arc<RTCRtpSender>,
    closed: AtomicBool,
    stats: TrackStats,
}

impl WebRtcSender {
    pub fn new(track: Arc<TrackLocalStaticRTP>, rtp_sender: Arc<RTCRtpSender>) -> Self {
        Self {
            track,
            rtp_sender,
            closed: AtomicBool::new(false),
            stats: TrackStats::default(),
        }
    }
}

#[async_trait]
impl Sender for WebRtcSender {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SfuError::ChannelClosed);
        }
        self.track.write_rtp(packet).await?;
        self.stats.record(packet);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.rtp_sender.stop().await {
            tracing::debug!("Error stopping RTP sender for {}: {}", self.track.id(), e);
        }
    }

    fn stats(&self) -> String {
        format!("webrtc {}", self.stats)
    }
}
