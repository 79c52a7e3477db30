//! One physical relay connection shared by many logical sessions.
//!
//! Frames are length-delimited; each frame holds exactly one relay packet. A
//! single reader task per link decodes frames and hands each payload to the
//! [`SessionConn`] bound to the packet's session ID. Writes from every session
//! go through one sink guarded by a mutex.

use bytes::Bytes;
use fanout_protocol::{CONTROL_SESSION_ID, ControlMessage, PROTOCOL_VERSION, Packet, PacketError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::SessionConn;
use crate::error::{Result, SfuError};

/// Largest frame sent to or accepted from a peer
pub(crate) const MAX_FRAME_LENGTH: usize = 256 * 1024;

/// Byte stream a relay link can run over
pub trait RelayIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RelayIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type FramedIo = Framed<Box<dyn RelayIo>, LengthDelimitedCodec>;

/// What the reader task hands to a session
pub(crate) type Inbound = std::result::Result<Bytes, PacketError>;

struct SessionEntry {
    generation: u64,
    tx: mpsc::UnboundedSender<Inbound>,
    closed: CancellationToken,
}

pub(crate) struct Link {
    peer: String,
    sink: Mutex<SplitSink<FramedIo, Bytes>>,
    sessions: RwLock<HashMap<u32, SessionEntry>>,
    /// Present on the listening side: sessions opened by the peer go here
    accept_tx: Option<mpsc::UnboundedSender<SessionConn>>,
    /// Dialed links are torn down once their last session closes
    release_when_idle: bool,
    next_generation: AtomicU64,
    closed: CancellationToken,
}

fn framed(io: Box<dyn RelayIo>) -> FramedIo {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(io, codec)
}

impl Link {
    /// Start a link as the dialing side: announce ourselves, then run.
    pub(crate) async fn dial(io: Box<dyn RelayIo>, node_id: &str, peer: String) -> Result<Arc<Self>> {
        let mut framed = framed(io);
        framed
            .send(ControlMessage::hello(node_id).to_packet()?.marshal())
            .await?;

        tracing::debug!("Sent relay hello to {} as {}", peer, node_id);

        Ok(Self::spawn(framed, peer, None, true))
    }

    /// Start a link as the listening side. The first frame must be a hello
    /// with a matching protocol version.
    pub(crate) async fn accept(
        io: Box<dyn RelayIo>,
        accept_tx: mpsc::UnboundedSender<SessionConn>,
        remote_addr: String,
    ) -> Result<Arc<Self>> {
        let mut framed = framed(io);

        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => {
                return Err(SfuError::Handshake(
                    "connection closed before hello".to_string(),
                ));
            }
        };

        let packet = Packet::unmarshal(frame.freeze())?;
        if packet.session_id() != CONTROL_SESSION_ID {
            return Err(SfuError::Handshake(format!(
                "expected hello, got data for session {}",
                packet.session_id()
            )));
        }

        let node_id = match ControlMessage::from_payload(&packet.payload)? {
            ControlMessage::Hello { version, node_id } if version == PROTOCOL_VERSION => node_id,
            ControlMessage::Hello { version, .. } => {
                return Err(SfuError::Handshake(format!(
                    "unsupported relay protocol version {}",
                    version
                )));
            }
            other => {
                return Err(SfuError::Handshake(format!(
                    "expected hello, got {:?}",
                    other
                )));
            }
        };

        let peer = format!("{}@{}", node_id, remote_addr);
        Ok(Self::spawn(framed, peer, Some(accept_tx), false))
    }

    fn spawn(
        framed: FramedIo,
        peer: String,
        accept_tx: Option<mpsc::UnboundedSender<SessionConn>>,
        release_when_idle: bool,
    ) -> Arc<Self> {
        let (sink, stream) = framed.split();

        let link = Arc::new(Self {
            peer,
            sink: Mutex::new(sink),
            sessions: RwLock::new(HashMap::new()),
            accept_tx,
            release_when_idle,
            next_generation: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(link.clone().read_loop(stream));

        link
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Open a session from this end and announce it to the peer
    pub(crate) async fn open(self: &Arc<Self>, id: u32) -> Result<SessionConn> {
        if id == CONTROL_SESSION_ID {
            return Err(SfuError::ReservedSessionId(id));
        }

        let conn = {
            let mut sessions = self.sessions.write().await;
            if self.closed.is_cancelled() {
                return Err(SfuError::RelaySessionClosed(id));
            }
            if sessions.contains_key(&id) {
                return Err(SfuError::DuplicateRelaySession(id));
            }
            self.register(&mut sessions, id)
        };

        self.send_control(&ControlMessage::OpenSession { session_id: id })
            .await?;

        tracing::debug!("Opened relay session {} to {}", id, self.peer);

        Ok(conn)
    }

    fn register(self: &Arc<Self>, sessions: &mut HashMap<u32, SessionEntry>, id: u32) -> SessionConn {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = self.closed.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        sessions.insert(
            id,
            SessionEntry {
                generation,
                tx,
                closed: closed.clone(),
            },
        );

        SessionConn::new(id, generation, self.clone(), rx, closed)
    }

    /// Write one encoded packet. An oversized frame is refused without
    /// touching the link; any other failed write is fatal to it.
    pub(crate) async fn write_frame(&self, frame: Bytes) -> Result<()> {
        if frame.len() > MAX_FRAME_LENGTH {
            return Err(SfuError::PayloadTooLarge {
                size: frame.len(),
                max: MAX_FRAME_LENGTH,
            });
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(frame).await {
            drop(sink);
            tracing::warn!("Relay link to {} failed on write: {}", self.peer, e);
            self.closed.cancel();
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        self.write_frame(message.to_packet()?.marshal()).await
    }

    /// Unregister a locally closed session and tell the peer about it
    pub(crate) async fn release(&self, id: u32, generation: u64) {
        let (removed, idle) = {
            let mut sessions = self.sessions.write().await;
            let removed = match sessions.get(&id) {
                Some(entry) if entry.generation == generation => sessions.remove(&id).is_some(),
                _ => false,
            };
            let idle = removed && sessions.is_empty() && self.release_when_idle;
            if idle {
                // Stop new opens before the lock is released
                self.closed.cancel();
            }
            (removed, idle)
        };

        if removed {
            if let Err(e) = self
                .send_control(&ControlMessage::CloseSession { session_id: id })
                .await
            {
                tracing::debug!("Could not announce close of relay session {}: {}", id, e);
            }
            tracing::debug!("Closed relay session {} to {}", id, self.peer);
        }

        if idle {
            tracing::info!("Releasing idle relay link to {}", self.peer);
            self.shutdown().await;
        }
    }

    /// Close the link and every session on it
    pub(crate) async fn shutdown(&self) {
        self.closed.cancel();

        let sessions: Vec<SessionEntry> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in sessions {
            entry.closed.cancel();
        }

        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!("Error closing relay link to {}: {}", self.peer, e);
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<FramedIo>) {
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => match Packet::unmarshal(frame.freeze()) {
                    Ok(packet) => self.route(packet).await,
                    Err(e) => {
                        tracing::warn!("Malformed frame from relay peer {}: {}", self.peer, e);
                        self.fail_sessions(e).await;
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!("Relay link to {} lost: {}", self.peer, e);
                    break;
                }
                None => {
                    tracing::info!("Relay link to {} closed by peer", self.peer);
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn fail_sessions(&self, error: PacketError) {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    async fn route(self: &Arc<Self>, packet: Packet) {
        let id = packet.session_id();

        if id == CONTROL_SESSION_ID {
            self.handle_control(&packet.payload).await;
            return;
        }

        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(&id) {
                if entry.tx.send(Ok(packet.payload)).is_err() {
                    tracing::debug!("Relay session {} reader is gone, dropping packet", id);
                }
                return;
            }
        }

        // First data for a session the peer never announced
        match self.accept_remote(id).await {
            Some(tx) => {
                let _ = tx.send(Ok(packet.payload));
            }
            None => tracing::debug!(
                "Dropping packet for unknown relay session {} from {}",
                id,
                self.peer
            ),
        }
    }

    async fn handle_control(self: &Arc<Self>, payload: &[u8]) {
        let message = match ControlMessage::from_payload(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Invalid relay control message from {}: {}", self.peer, e);
                return;
            }
        };

        match message {
            ControlMessage::OpenSession { session_id } if session_id != CONTROL_SESSION_ID => {
                if self.accept_remote(session_id).await.is_none() {
                    tracing::debug!(
                        "Ignoring open of relay session {} from {}",
                        session_id,
                        self.peer
                    );
                }
            }
            ControlMessage::CloseSession { session_id } => {
                let (entry, idle) = {
                    let mut sessions = self.sessions.write().await;
                    let entry = sessions.remove(&session_id);
                    let idle = entry.is_some() && sessions.is_empty() && self.release_when_idle;
                    if idle {
                        self.closed.cancel();
                    }
                    (entry, idle)
                };
                if let Some(entry) = entry {
                    entry.closed.cancel();
                    tracing::debug!("Relay session {} closed by {}", session_id, self.peer);
                }
                if idle {
                    tracing::info!("Releasing idle relay link to {}", self.peer);
                }
            }
            other => {
                tracing::warn!("Unexpected relay control message from {}: {:?}", self.peer, other);
            }
        }
    }

    /// Register a session opened by the peer and queue it for acceptance.
    /// Returns `None` when this end does not accept sessions.
    async fn accept_remote(self: &Arc<Self>, id: u32) -> Option<mpsc::UnboundedSender<Inbound>> {
        let accept_tx = self.accept_tx.as_ref()?;

        let (conn, tx) = {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get(&id) {
                return Some(entry.tx.clone());
            }
            let conn = self.register(&mut sessions, id);
            let tx = sessions.get(&id)?.tx.clone();
            (conn, tx)
        };

        tracing::debug!("Relay session {} opened by {}", id, self.peer);

        if accept_tx.send(conn).is_err() {
            tracing::warn!("Relay session {} from {} has no acceptor", id, self.peer);
        }

        Some(tx)
    }
}
