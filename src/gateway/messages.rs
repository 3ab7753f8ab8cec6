//! Wire messages
//!
//! One JSON object per event, tagged by `type` with dotted event names.

use crate::errors::ArenaError;
use crate::types::{
    EnforcementAction, GameMode, GameRoom, PlayerId, RoomId, RoomState, SessionStatus, TelemetryReport, TicketId,
};
use serde::{Deserialize, Serialize};

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "matchmaking.join", rename_all = "camelCase")]
    MatchmakingJoin {
        game_id: String,
        mode: GameMode,
        skill_rating: f64,
        /// Resume a ticket after reconnecting
        #[serde(default)]
        ticket_id: Option<TicketId>,
    },

    #[serde(rename = "matchmaking.leave", rename_all = "camelCase")]
    MatchmakingLeave { ticket_id: TicketId },

    #[serde(rename = "room.join", rename_all = "camelCase")]
    RoomJoin { room_id: RoomId },

    #[serde(rename = "room.ready", rename_all = "camelCase")]
    RoomReady { room_id: RoomId },

    #[serde(rename = "room.action", rename_all = "camelCase")]
    RoomAction {
        room_id: RoomId,
        action: serde_json::Value,
        #[serde(default)]
        client_timestamp: Option<u64>,
    },

    #[serde(rename = "room.score_update", rename_all = "camelCase")]
    RoomScoreUpdate { room_id: RoomId, score: i64 },

    #[serde(rename = "room.end", rename_all = "camelCase")]
    RoomEnd {
        room_id: RoomId,
        final_score: i64,
        #[serde(default)]
        action_log_ref: Option<String>,
    },

    #[serde(rename = "room.telemetry", rename_all = "camelCase")]
    RoomTelemetry {
        room_id: RoomId,
        telemetry: TelemetryReport,
    },
}

/// One player's line in a settlement payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub player_id: PlayerId,
    pub session_id: String,
    pub score: i64,
    pub rank: Option<u32>,
    pub status: SessionStatus,
    pub validated: bool,
    pub reward: u64,
    pub suspicion_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "matchmaking.queued", rename_all = "camelCase")]
    MatchmakingQueued { ticket_id: TicketId },

    #[serde(rename = "matchmaking.found", rename_all = "camelCase")]
    MatchmakingFound {
        room_id: RoomId,
        game_id: String,
        mode: GameMode,
        ticket_id: TicketId,
        players: Vec<PlayerId>,
    },

    #[serde(rename = "matchmaking.timeout", rename_all = "camelCase")]
    MatchmakingTimeout { ticket_id: TicketId },

    #[serde(rename = "matchmaking.left", rename_all = "camelCase")]
    MatchmakingLeft { ticket_id: TicketId },

    #[serde(rename = "room.joined", rename_all = "camelCase")]
    RoomJoined { room: GameRoom },

    #[serde(rename = "room.player_joined", rename_all = "camelCase")]
    RoomPlayerJoined { room_id: RoomId, player_id: PlayerId },

    #[serde(rename = "room.player_ready", rename_all = "camelCase")]
    RoomPlayerReady {
        room_id: RoomId,
        player_id: PlayerId,
        ready_count: usize,
    },

    #[serde(rename = "room.player_left", rename_all = "camelCase")]
    RoomPlayerLeft { room_id: RoomId, player_id: PlayerId },

    #[serde(rename = "room.state", rename_all = "camelCase")]
    RoomStateChanged { room_id: RoomId, state: RoomState },

    #[serde(rename = "room.started", rename_all = "camelCase")]
    RoomStarted { room_id: RoomId, start_time: u64 },

    #[serde(rename = "room.action", rename_all = "camelCase")]
    RoomAction {
        room_id: RoomId,
        player_id: PlayerId,
        seq: u64,
        action: serde_json::Value,
        client_timestamp: Option<u64>,
        server_timestamp: u64,
    },

    #[serde(rename = "room.score_update", rename_all = "camelCase")]
    RoomScoreUpdate {
        room_id: RoomId,
        player_id: PlayerId,
        score: i64,
        server_timestamp: u64,
    },

    #[serde(rename = "room.result", rename_all = "camelCase")]
    RoomResult {
        room_id: RoomId,
        state: RoomState,
        standings: Vec<Standing>,
    },

    #[serde(rename = "room.verdict", rename_all = "camelCase")]
    RoomVerdict {
        room_id: RoomId,
        action: EnforcementAction,
        reason: String,
    },

    #[serde(rename = "room.error", rename_all = "camelCase")]
    RoomError { code: String, message: String },
}

impl ServerMessage {
    pub fn error(err: &ArenaError) -> Self {
        ServerMessage::RoomError {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Event name as it appears in the `type` field
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::MatchmakingQueued { .. } => "matchmaking.queued",
            ServerMessage::MatchmakingFound { .. } => "matchmaking.found",
            ServerMessage::MatchmakingTimeout { .. } => "matchmaking.timeout",
            ServerMessage::MatchmakingLeft { .. } => "matchmaking.left",
            ServerMessage::RoomJoined { .. } => "room.joined",
            ServerMessage::RoomPlayerJoined { .. } => "room.player_joined",
            ServerMessage::RoomPlayerReady { .. } => "room.player_ready",
            ServerMessage::RoomPlayerLeft { .. } => "room.player_left",
            ServerMessage::RoomStateChanged { .. } => "room.state",
            ServerMessage::RoomStarted { .. } => "room.started",
            ServerMessage::RoomAction { .. } => "room.action",
            ServerMessage::RoomScoreUpdate { .. } => "room.score_update",
            ServerMessage::RoomResult { .. } => "room.result",
            ServerMessage::RoomVerdict { .. } => "room.verdict",
            ServerMessage::RoomError { .. } => "room.error",
        }
    }
}

/// A message addressed to a set of players
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub recipients: Vec<PlayerId>,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn to(recipients: Vec<PlayerId>, message: ServerMessage) -> Self {
        Self { recipients, message }
    }

    pub fn one(player_id: &str, message: ServerMessage) -> Self {
        Self {
            recipients: vec![player_id.to_string()],
            message,
        }
    }
}
