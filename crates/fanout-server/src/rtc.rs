//! Shared WebRTC API: media engine, interceptors, ICE settings.

use axum::{Json, extract::State};
use serde::Serialize;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::config::WebRtcConfig;
use crate::error::Result;
use crate::sfu::codec;
use crate::state::AppState;

/// Builds peer connections for every WebRTC transport on this node
pub struct WebRtcApi {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcApi {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        codec::register_codecs(&mut media_engine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((start, end)) = config.port_range() {
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(EphemeralUDP::new(start, end)?));
            tracing::info!("ICE candidates restricted to UDP ports {}-{}", start, end);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }

    pub async fn new_peer_connection(&self) -> Result<RTCPeerConnection> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        Ok(self.api.new_peer_connection(config).await?)
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }
}

#[derive(Debug, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

/// ICE servers clients should use when connecting to this node
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let ice_servers = state
        .sfu
        .webrtc()
        .ice_servers()
        .iter()
        .map(|server| IceServer {
            urls: server.urls.clone(),
            username: (!server.username.is_empty()).then(|| server.username.clone()),
            credential: (!server.credential.is_empty()).then(|| server.credential.clone()),
        })
        .collect();

    Json(IceServersResponse { ice_servers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerConfig;

    #[tokio::test]
    async fn test_builds_peer_connection_with_ice_servers() {
        let config = WebRtcConfig {
            ice_port_range: vec![],
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: String::new(),
                credential: String::new(),
            }],
        };

        let api = WebRtcApi::new(&config).unwrap();
        assert_eq!(api.ice_servers().len(), 1);

        let pc = api.new_peer_connection().await.unwrap();
        pc.close().await.unwrap();
    }

    #[test]
    fn test_invalid_port_range_is_rejected() {
        let config = WebRtcConfig {
            ice_port_range: vec![6000, 5000],
            ice_servers: vec![],
        };

        assert!(WebRtcApi::new(&config).is_err());
    }
}
