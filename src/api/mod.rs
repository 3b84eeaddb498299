pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::app_state::{AppState, StatusSnapshot};

/// The WebSocket feed plus a status probe. The administrative REST surface
/// lives elsewhere; this router only carries the live feed transport.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.snapshot())
}
