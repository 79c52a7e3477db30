use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fanout_protocol::PacketError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("payload type not supported")]
    PayloadTypeUnsupported,

    #[error("method not supported")]
    MethodUnsupported,

    #[error("receiver closed")]
    ReceiverClosed,

    #[error("session {0} is closed")]
    SessionClosed(u32),

    #[error("relay session {0} is closed")]
    RelaySessionClosed(u32),

    #[error("session id {0} is reserved for relay control")]
    ReservedSessionId(u32),

    #[error("relay session {0} is already open on this link")]
    DuplicateRelaySession(u32),

    #[error("relay payload of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("relay listener closed")]
    ListenerClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    #[error("malformed relay packet: {0}")]
    Decode(#[from] PacketError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("ice error: {0}")]
    Ice(#[from] webrtc::ice::Error),

    #[error("rtp error: {0}")]
    Rtp(#[from] webrtc::util::Error),

    #[error("invalid control message: {0}")]
    Control(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl IntoResponse for SfuError {
    fn into_response(self) -> Response {
        let status = match &self {
            SfuError::PayloadTypeUnsupported => StatusCode::UNPROCESSABLE_ENTITY,
            SfuError::NotFound(_) => StatusCode::NOT_FOUND,
            SfuError::MethodUnsupported => StatusCode::METHOD_NOT_ALLOWED,
            SfuError::ReservedSessionId(_) | SfuError::WebRtc(_) => StatusCode::BAD_REQUEST,
            SfuError::SessionClosed(_)
            | SfuError::RelaySessionClosed(_)
            | SfuError::DuplicateRelaySession(_) => StatusCode::CONFLICT,
            SfuError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SfuError::Io(_) | SfuError::Handshake(_) => StatusCode::BAD_GATEWAY,
            _ => {
                tracing::error!("Internal error: {:?}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(error: SfuError) -> StatusCode {
        error.into_response().status()
    }

    #[test]
    fn test_relay_conflicts_map_to_conflict() {
        assert_eq!(status(SfuError::DuplicateRelaySession(4)), StatusCode::CONFLICT);
        assert_eq!(status(SfuError::RelaySessionClosed(4)), StatusCode::CONFLICT);
        assert_eq!(status(SfuError::SessionClosed(4)), StatusCode::CONFLICT);
    }

    #[test]
    fn test_client_and_gateway_errors() {
        assert_eq!(
            status(SfuError::PayloadTooLarge { size: 300_000, max: 262_144 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(status(SfuError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(SfuError::MethodUnsupported), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(status(SfuError::Handshake("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status(SfuError::ChannelClosed), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
