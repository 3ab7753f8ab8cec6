//! Route Definitions

use super::handlers::*;
use axum::{routing::get, Router};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/leaderboard/:game_id", get(leaderboard_handler))
        .route("/sessions/:session_id", get(session_handler))
        .route("/rooms/:room_id", get(room_handler))
        // Realtime gateway
        .route("/ws", get(websocket_handler))
        .with_state(state)
}
