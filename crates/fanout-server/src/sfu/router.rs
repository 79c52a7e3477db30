//! Router: fans one published stream out to every subscriber.
//!
//! Packets are read from the publisher and written to a snapshot of the
//! subscriber set, so registering a subscriber never waits on a slow write.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet as RtpPacket;

use super::media::{Receiver, Sender};
use crate::error::{Result, SfuError};

pub struct Router {
    /// The single publisher feeding this router
    publisher: Arc<dyn Receiver>,
    /// Transport that published the stream
    publisher_id: String,
    /// Subscriber transport ID -> sender
    subscribers: RwLock<HashMap<String, Arc<dyn Sender>>>,
    closing: AtomicBool,
    closed: CancellationToken,
    forwarded: AtomicU64,
    failed_writes: AtomicU64,
}

impl Router {
    pub fn new(publisher: Arc<dyn Receiver>, publisher_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            publisher,
            publisher_id: publisher_id.into(),
            subscribers: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            forwarded: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
        })
    }

    /// Stream identifier of the published stream
    pub fn ssrc(&self) -> u32 {
        self.publisher.ssrc()
    }

    pub fn publisher(&self) -> &Arc<dyn Receiver> {
        &self.publisher
    }

    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    /// Packets read from the publisher so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Subscriber writes that failed so far
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Add or replace the subscriber for transport `id`. It receives every
    /// packet published from now on; nothing is replayed.
    pub async fn add_sub(&self, id: impl Into<String>, sender: Arc<dyn Sender>) -> Result<()> {
        let id = id.into();

        let replaced = {
            let mut subscribers = self.subscribers.write().await;
            if self.closed.is_cancelled() {
                drop(subscribers);
                sender.close().await;
                return Err(SfuError::ReceiverClosed);
            }
            subscribers.insert(id.clone(), sender.clone())
        };

        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, &sender) {
                old.close().await;
            }
        }

        tracing::info!(
            "Added subscriber {} to router {} (publisher: {})",
            id,
            self.ssrc(),
            self.publisher_id
        );

        Ok(())
    }

    /// Remove and close the subscriber for transport `id`
    pub async fn remove_sub(&self, id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(id);

        match removed {
            Some(sender) => {
                sender.close().await;
                tracing::info!("Removed subscriber {} from router {}", id, self.ssrc());
                true
            }
            None => false,
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.read().await.keys().cloned().collect()
    }

    /// Spawn the task that reads the publisher until it ends, then closes the
    /// router
    pub fn start_forwarding(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().forward_loop())
    }

    async fn forward_loop(self: Arc<Self>) {
        tracing::info!(
            "Starting forwarding for router {} from {}",
            self.ssrc(),
            self.publisher_id
        );

        loop {
            let packet = tokio::select! {
                _ = self.closed.cancelled() => break,
                read = self.publisher.read_rtp() => match read {
                    Ok(packet) => packet,
                    Err(SfuError::ReceiverClosed) => {
                        tracing::info!("Publisher for router {} ended", self.ssrc());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Error reading publisher for router {}: {}", self.ssrc(), e);
                        break;
                    }
                },
            };

            self.forward_packet(&packet).await;
        }

        self.close().await;
    }

    /// Write `packet` to every current subscriber. Failing subscribers are
    /// removed without affecting the others.
    pub async fn forward_packet(&self, packet: &RtpPacket) {
        let count = self.forwarded.fetch_add(1, Ordering::Relaxed) + 1;

        let subscribers: Vec<(String, Arc<dyn Sender>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect();

        if count % 1000 == 1 {
            tracing::debug!(
                "Router {} forwarding packet {} to {} subscribers",
                self.ssrc(),
                count,
                subscribers.len()
            );
        }

        let results = join_all(
            subscribers
                .iter()
                .map(|(_, sender)| sender.write_rtp(packet)),
        )
        .await;

        let failed: Vec<(String, Arc<dyn Sender>)> = subscribers
            .into_iter()
            .zip(results)
            .filter_map(|((id, sender), result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(
                        "Failed to forward packet on router {} to subscriber {}: {}",
                        self.ssrc(),
                        id,
                        e
                    );
                    Some((id, sender))
                }
            })
            .collect();

        if !failed.is_empty() {
            self.failed_writes
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            self.drop_subscribers(failed).await;
        }
    }

    async fn drop_subscribers(&self, failed: Vec<(String, Arc<dyn Sender>)>) {
        let mut removed = Vec::with_capacity(failed.len());
        {
            let mut subscribers = self.subscribers.write().await;
            for (id, sender) in failed {
                // Only if it was not replaced in the meantime
                let same = subscribers
                    .get(&id)
                    .is_some_and(|current| Arc::ptr_eq(current, &sender));
                if same {
                    subscribers.remove(&id);
                    removed.push((id, sender));
                }
            }
        }

        for (id, sender) in removed {
            sender.close().await;
            tracing::info!("Dropped subscriber {} from router {}", id, self.ssrc());
        }
    }

    /// Release the publisher and close every subscriber. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        self.closed.cancel();
        self.publisher.close();

        let subscribers: Vec<Arc<dyn Sender>> = self
            .subscribers
            .write()
            .await
            .drain()
            .map(|(_, sender)| sender)
            .collect();

        join_all(subscribers.iter().map(|sender| sender.close())).await;

        tracing::info!(
            "Closed router {} from {} ({} subscribers released)",
            self.ssrc(),
            self.publisher_id,
            subscribers.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the router is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Diagnostic snapshot. Subscribers are listed individually while there
    /// are fewer than `max_listed`.
    pub async fn stats(&self, max_listed: usize) -> String {
        let mut info = String::new();
        let _ = writeln!(
            info,
            "    router: {} | {} | forwarded: {} failed: {}",
            self.ssrc(),
            self.publisher.stats(),
            self.forwarded(),
            self.failed_writes()
        );

        let subscribers = self.subscribers.read().await;
        if subscribers.len() < max_listed {
            for (id, sender) in subscribers.iter() {
                let _ = writeln!(info, "      sub: {} | {}", id, sender.stats());
            }
            info.push('\n');
        } else {
            let _ = writeln!(info, "      subs: {}\n", subscribers.len());
        }

        info
    }
}
