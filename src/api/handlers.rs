//! Request Handlers
//!
//! Read-only views over sessions, rooms and leaderboards, plus the
//! WebSocket upgrade into the realtime gateway.

use super::{
    errors::ApiError,
    middleware::RequestId,
    models::{HealthResponse, LeaderboardQuery, LeaderboardResponse, WsParams},
};
use crate::gateway::{ws::serve_socket, RealtimeGateway};
use crate::matchmaking::MatchmakingQueue;
use crate::metrics::MetricsRegistry;
use crate::rooms::{GameRoomManager, RoomSnapshot};
use crate::store::SessionStore;
use crate::types::PlayerSession;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub version: String,
    pub games: HashSet<String>,
    pub queue: Arc<MatchmakingQueue>,
    pub rooms: Arc<GameRoomManager>,
    pub gateway: Arc<RealtimeGateway>,
    pub sessions: Arc<dyn SessionStore>,
    pub metrics: Arc<MetricsRegistry>,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
        uptime_secs: state.metrics.uptime_secs(),
        active_rooms: state.rooms.active_rooms(),
        queued_tickets: state.queue.queued_count(),
        connections: state.gateway.connection_count(),
    })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.to_prometheus_format(),
    )
        .into_response()
}

/// GET /leaderboard/:game_id
pub async fn leaderboard_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
    Query(params): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    if !state.games.contains(&game_id) {
        return Err(ApiError::not_found(
            request_id.0,
            "UNKNOWN_GAME",
            format!("Unknown game: {}", game_id),
        ));
    }
    // Enforce maximum limit
    let limit = params.limit.clamp(1, 100);

    let sessions = state
        .sessions
        .leaderboard(&game_id, limit)
        .await
        .map_err(|e| ApiError::from_arena(request_id.0.clone(), &e))?;

    Ok(Json(LeaderboardResponse::from_sessions(game_id, sessions)))
}

/// GET /sessions/:session_id
pub async fn session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<PlayerSession>, ApiError> {
    state
        .sessions
        .get_session(&session_id)
        .await
        .map_err(|e| ApiError::from_arena(request_id.0.clone(), &e))?
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(
                request_id.0.clone(),
                "SESSION_NOT_FOUND",
                format!("Session {} not found", session_id),
            )
        })
}

/// GET /rooms/:room_id
pub async fn room_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, ApiError> {
    state
        .rooms
        .room_snapshot(&room_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(request_id.0, "ROOM_NOT_FOUND", format!("Room {} not found", room_id)))
}

/// GET /ws?player_id=...
pub async fn websocket_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let player_id = params
        .player_id
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(request_id.0, "player_id query parameter is required".to_string()))?;

    let gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| serve_socket(gateway, socket, player_id)))
}
