//! Error types for the game session pipeline
//!
//! Every rejection carries a stable wire code so transport layers can surface
//! it to the offending client without leaking internals.

use crate::types::{RoomState, TicketId};

/// Root error type for all Arena operations
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("Ticket {0} has expired")]
    TicketExpired(TicketId),

    #[error("Ticket {0} not found")]
    TicketNotFound(TicketId),

    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Player {player_id} is not a member of room {room_id}")]
    NotRoomMember { room_id: String, player_id: String },

    #[error("Invalid room transition from {from} to {to}")]
    InvalidTransition { from: RoomState, to: RoomState },

    #[error("Room {room_id} is full (capacity {capacity})")]
    RoomFull { room_id: String, capacity: usize },

    #[error("Unknown game: {0}")]
    UnknownGame(String),

    #[error("Score validation failed: {0}")]
    ValidationFailed(String),

    #[error("Collaborator unavailable: {collaborator} ({reason})")]
    CollaboratorUnavailable { collaborator: &'static str, reason: String },

    #[error("Ticket {ticket_id} already belongs to room {existing_room}")]
    DuplicateMatch { ticket_id: TicketId, existing_room: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue { field: String, value: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

/// Storage system errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Session {0} is finalized and immutable")]
    ImmutableSession(String),
}

impl ArenaError {
    /// Stable code used on the wire (`room.error`) and in HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ArenaError::TicketExpired(_) => "TICKET_EXPIRED",
            ArenaError::TicketNotFound(_) => "TICKET_NOT_FOUND",
            ArenaError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            ArenaError::NotRoomMember { .. } => "NOT_ROOM_MEMBER",
            ArenaError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ArenaError::RoomFull { .. } => "ROOM_FULL",
            ArenaError::UnknownGame(_) => "UNKNOWN_GAME",
            ArenaError::ValidationFailed(_) => "VALIDATION_FAILED",
            ArenaError::CollaboratorUnavailable { .. } => "COLLABORATOR_UNAVAILABLE",
            ArenaError::DuplicateMatch { .. } => "DUPLICATE_MATCH",
            ArenaError::RateLimited => "RATE_LIMITED",
            ArenaError::BadRequest(_) => "BAD_PAYLOAD",
            ArenaError::Configuration(_) => "CONFIGURATION_ERROR",
            ArenaError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the error is caused by the client rather than the server
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            ArenaError::CollaboratorUnavailable { .. }
                | ArenaError::DuplicateMatch { .. }
                | ArenaError::Configuration(_)
                | ArenaError::Storage(_)
        )
    }
}

impl From<rocksdb::Error> for ArenaError {
    fn from(e: rocksdb::Error) -> Self {
        ArenaError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

// Convenience type alias for Results
pub type ArenaResult<T> = Result<T, ArenaError>;
