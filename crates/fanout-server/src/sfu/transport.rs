use async_trait::async_trait;
use std::sync::Arc;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::router::Router;
use crate::error::{Result, SfuError};

/// One endpoint attached to a session, either a WebRTC peer or a relay link
/// to another node. A transport publishes the streams it receives and
/// subscribes to the streams of every other transport in its session.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    /// Start receiving the stream of `router`. With `renegotiate` the
    /// transport announces the new track to its remote end.
    async fn subscribe(&self, router: Arc<Router>, renegotiate: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn stats(&self) -> String;

    /// Apply the remote answer to an offer this transport produced
    async fn set_remote_description(&self, _answer: RTCSessionDescription) -> Result<()> {
        Err(SfuError::MethodUnsupported)
    }

    /// Take the renegotiation offer waiting for the remote end, if any
    async fn pending_offer(&self) -> Result<Option<RTCSessionDescription>> {
        Err(SfuError::MethodUnsupported)
    }
}
