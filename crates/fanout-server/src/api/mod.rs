mod sessions;

use crate::state::AppState;
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        .route("/ice-servers", get(crate::rtc::get_ice_servers))
        .route("/stats", get(stats))
        // Session signaling
        .route("/sessions/{id}/offer", post(sessions::offer))
        .route("/sessions/{id}/relay", post(sessions::relay))
        .route(
            "/sessions/{id}/transports/{transport_id}/offer",
            get(sessions::pending_offer),
        )
        .route(
            "/sessions/{id}/transports/{transport_id}/answer",
            post(sessions::answer),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sessions: usize,
    pub report: String,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let sessions = state.sfu.registry().len();
    let report = state.sfu.stats_report().await.unwrap_or_default();
    Json(StatsResponse { sessions, report })
}
