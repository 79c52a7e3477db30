use bytes::Bytes;
use fanout_protocol::Packet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::link::{Inbound, Link};
use crate::error::{Result, SfuError};

/// A logical relay stream for one session, multiplexed over a shared link.
///
/// Reads are packet oriented: every `recv`/`read` yields exactly one payload
/// written by the peer's matching session, in order.
pub struct SessionConn {
    id: u32,
    generation: u64,
    link: Arc<Link>,
    rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: CancellationToken,
    released: AtomicBool,
}

impl SessionConn {
    pub(crate) fn new(
        id: u32,
        generation: u64,
        link: Arc<Link>,
        rx: mpsc::UnboundedReceiver<Inbound>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            generation,
            link,
            rx: Mutex::new(rx),
            closed,
            released: AtomicBool::new(false),
        }
    }

    /// Session ID this stream is bound to
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Remote node, for logging
    pub fn peer(&self) -> &str {
        self.link.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once this session is closed from either end or its link dies
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Send `buf` as one packet. Returns the number of payload bytes written.
    /// A payload too large for one frame fails with
    /// [`SfuError::PayloadTooLarge`] and leaves the session open.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(SfuError::RelaySessionClosed(self.id));
        }

        let packet = Packet::new(self.id, Bytes::copy_from_slice(buf));
        self.link.write_frame(packet.marshal()).await?;

        Ok(buf.len())
    }

    /// Receive the next payload for this session.
    ///
    /// Payloads already delivered before the peer closed are still returned;
    /// after that every call fails.
    pub async fn recv(&self) -> Result<Bytes> {
        if self.released.load(Ordering::Acquire) {
            return Err(SfuError::RelaySessionClosed(self.id));
        }

        let mut rx = self.rx.lock().await;

        tokio::select! {
            biased;
            inbound = rx.recv() => match inbound {
                Some(Ok(payload)) => Ok(payload),
                Some(Err(e)) => {
                    self.closed.cancel();
                    Err(e.into())
                }
                None => {
                    self.closed.cancel();
                    Err(SfuError::RelaySessionClosed(self.id))
                }
            },
            _ = self.closed.cancelled() => Err(SfuError::RelaySessionClosed(self.id)),
        }
    }

    /// Read one packet into `buf`. A payload longer than `buf` is truncated;
    /// the return value is the number of bytes copied.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let payload = self.recv().await?;

        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);

        if n < payload.len() {
            tracing::trace!(
                "Truncated relay payload on session {} from {} to {} bytes",
                self.id,
                payload.len(),
                n
            );
        }

        Ok(n)
    }

    /// Close this session. Idempotent; the shared link stays up for other
    /// sessions.
    pub async fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.closed.cancel();
        self.link.release(self.id, self.generation).await;

        Ok(())
    }
}

impl Drop for SessionConn {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.closed.cancel();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let link = self.link.clone();
            let (id, generation) = (self.id, self.generation);
            handle.spawn(async move {
                link.release(id, generation).await;
            });
        }
    }
}

impl std::fmt::Debug for SessionConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConn")
            .field("id", &self.id)
            .field("peer", &self.link.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}
