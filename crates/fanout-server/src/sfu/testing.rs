//! In-memory publishers, subscribers and transports for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::header::Header as RtpHeader;
use webrtc::rtp::packet::Packet as RtpPacket;

use super::media::{Receiver, Sender};
use super::router::Router;
use super::transport::Transport;
use crate::error::{Result, SfuError};

pub(crate) fn rtp_packet(ssrc: u32, sequence_number: u16) -> RtpPacket {
    RtpPacket {
        header: RtpHeader {
            version: 2,
            payload_type: 111,
            sequence_number,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(b"media"),
    }
}

pub(crate) struct MockReceiver {
    ssrc: u32,
    payload_type: u8,
    tx: mpsc::UnboundedSender<RtpPacket>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RtpPacket>>,
    closed: CancellationToken,
}

impl MockReceiver {
    pub(crate) fn new(ssrc: u32) -> Arc<Self> {
        Self::with_payload_type(ssrc, 111)
    }

    pub(crate) fn with_payload_type(ssrc: u32, payload_type: u8) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ssrc,
            payload_type,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        })
    }

    pub(crate) fn publish(&self, packet: RtpPacket) {
        let _ = self.tx.send(packet);
    }

    /// Simulate the publisher going away
    pub(crate) fn end(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Receiver for MockReceiver {
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
            packet = rx.recv() => packet.ok_or(SfuError::ReceiverClosed),
            _ = self.closed.cancelled() => Err(SfuError::ReceiverClosed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn stats(&self) -> String {
        format!("mock {}", self.ssrc)
    }
}

#[derive(Default)]
pub(crate) struct MockSender {
    received: Mutex<Vec<u16>>,
    fail: AtomicBool,
    closes: AtomicUsize,
}

impl MockSender {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        let sender = Self::default();
        sender.fail.store(true, Ordering::SeqCst);
        Arc::new(sender)
    }

    /// Sequence numbers written so far
    pub(crate) fn received(&self) -> Vec<u16> {
        self.received.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.received.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber did not receive packets in time");
    }
}

#[async_trait]
impl Sender for MockSender {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SfuError::ChannelClosed);
        }
        self.received.lock().push(packet.header.sequence_number);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> String {
        format!("mock packets: {}", self.received.lock().len())
    }
}

/// Transport that subscribes with [`MockSender`]s and records every call
pub(crate) struct MockTransport {
    id: String,
    subscriptions: Mutex<Vec<(u32, bool)>>,
    senders: Mutex<Vec<(u32, Arc<MockSender>)>>,
    failing_ssrcs: HashSet<u32>,
    closes: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Self::failing_on(id, &[])
    }

    pub(crate) fn failing_on(id: &str, ssrcs: &[u32]) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            subscriptions: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            failing_ssrcs: ssrcs.iter().copied().collect(),
            closes: AtomicUsize::new(0),
        })
    }

    /// `(ssrc, renegotiate)` for every subscribe call, including failed ones
    pub(crate) fn subscriptions(&self) -> Vec<(u32, bool)> {
        self.subscriptions.lock().clone()
    }

    pub(crate) fn subscribed_ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.senders.lock().iter().map(|(ssrc, _)| *ssrc).collect();
        ssrcs.sort();
        ssrcs
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, router: Arc<Router>, renegotiate: bool) -> Result<()> {
        self.subscriptions.lock().push((router.ssrc(), renegotiate));

        if self.failing_ssrcs.contains(&router.ssrc()) {
            return Err(SfuError::PayloadTypeUnsupported);
        }

        let sender = MockSender::new();
        router.add_sub(self.id.clone(), sender.clone()).await?;
        self.senders.lock().push((router.ssrc(), sender));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> String {
        format!("    transport: {} (mock)\n", self.id)
    }
}
