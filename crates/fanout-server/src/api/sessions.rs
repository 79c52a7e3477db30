use crate::error::{Result, SfuError};
use crate::sfu::Transport;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Deserialize)]
pub struct SdpRequest {
    pub sdp: String,
}

#[derive(Debug, Serialize)]
pub struct OfferResponse {
    pub transport_id: String,
    pub sdp: String,
}

#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    pub addr: String,
}

#[derive(Debug, Serialize)]
pub struct RelayResponse {
    pub transport_id: String,
}

#[derive(Debug, Serialize)]
pub struct PendingOfferResponse {
    pub sdp: Option<String>,
}

/// Join a session with a WebRTC offer and get the answer back
pub async fn offer(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(input): Json<SdpRequest>,
) -> Result<Json<OfferResponse>> {
    let offer = RTCSessionDescription::offer(input.sdp)?;
    let (transport, answer) = state.sfu.new_webrtc_transport(id, offer).await?;

    Ok(Json(OfferResponse {
        transport_id: transport.id().to_string(),
        sdp: answer.sdp,
    }))
}

/// Forward a session to another node
pub async fn relay(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(input): Json<RelayRequest>,
) -> Result<Json<RelayResponse>> {
    let transport = state.sfu.new_relay_transport(id, &input.addr).await?;

    Ok(Json(RelayResponse {
        transport_id: transport.id().to_string(),
    }))
}

/// Renegotiation offer waiting for the peer, if any
pub async fn pending_offer(
    State(state): State<AppState>,
    Path((id, transport_id)): Path<(u32, String)>,
) -> Result<Json<PendingOfferResponse>> {
    let transport = find_transport(&state, id, &transport_id).await?;
    let offer = transport.pending_offer().await?;

    Ok(Json(PendingOfferResponse {
        sdp: offer.map(|offer| offer.sdp),
    }))
}

/// Complete a renegotiation started by the server
pub async fn answer(
    State(state): State<AppState>,
    Path((id, transport_id)): Path<(u32, String)>,
    Json(input): Json<SdpRequest>,
) -> Result<StatusCode> {
    let transport = find_transport(&state, id, &transport_id).await?;
    let answer = RTCSessionDescription::answer(input.sdp)?;
    transport.set_remote_description(answer).await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn find_transport(
    state: &AppState,
    session_id: u32,
    transport_id: &str,
) -> Result<Arc<dyn Transport>> {
    let session = state
        .sfu
        .get_session(session_id)
        .ok_or_else(|| SfuError::NotFound(format!("session {}", session_id)))?;

    session
        .transport(transport_id)
        .await
        .ok_or_else(|| SfuError::NotFound(format!("transport {}", transport_id)))
}
