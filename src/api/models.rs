//! API Response Models

use crate::types::{PlayerSession, SessionStatus};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_rooms: usize,
    pub queued_tickets: usize,
    pub connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub position: usize,
    pub player_id: String,
    pub session_id: String,
    pub room_id: String,
    pub score: i64,
    pub status: SessionStatus,
    pub ended_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardResponse {
    pub game_id: String,
    pub entries: Vec<LeaderboardEntry>,
}

impl LeaderboardResponse {
    pub fn from_sessions(game_id: String, sessions: Vec<PlayerSession>) -> Self {
        let entries = sessions
            .into_iter()
            .enumerate()
            .map(|(i, s)| LeaderboardEntry {
                position: i + 1,
                player_id: s.player_id,
                session_id: s.session_id,
                room_id: s.room_id,
                score: s.score,
                status: s.status,
                ended_at: s.end_time,
            })
            .collect();
        Self { game_id, entries }
    }
}

/// `/ws` query string
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub player_id: Option<String>,
}
