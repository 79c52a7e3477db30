//! Fanout server library
//!
//! Selective forwarding unit with a multiplexed relay between nodes. Exposed
//! as a library for tests and embedding.

pub mod api;
pub mod config;
pub mod error;
pub mod relay;
pub mod rtc;
pub mod sfu;
pub mod state;

use std::sync::Arc;

/// Start an SFU node and build the HTTP signaling router for it
pub async fn create_app(config: config::FanoutConfig) -> error::Result<(axum::Router, Arc<sfu::Sfu>)> {
    let sfu = sfu::Sfu::new(config).await?;
    let router = api::create_router(state::AppState::new(sfu.clone()));
    Ok((router, sfu))
}
