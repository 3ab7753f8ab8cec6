//! API Error Handling
//!
//! Structured error responses with proper HTTP status codes and request tracking.

use crate::errors::ArenaError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code (ROOM_NOT_FOUND, BAD_REQUEST, ...)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound { code: &'static str, message: String },
    BadRequest(String),
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, code: &'static str, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound { code, message },
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message),
            request_id,
        }
    }

    pub fn service_unavailable(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::ServiceUnavailable(message),
            request_id,
        }
    }

    /// Map a domain error onto an HTTP error, keeping its wire code for lookups
    pub fn from_arena(request_id: String, err: &ArenaError) -> Self {
        match err {
            ArenaError::RoomNotFound(_) | ArenaError::TicketNotFound(_) | ArenaError::UnknownGame(_) => {
                Self::not_found(request_id, err.code(), err.to_string())
            }
            ArenaError::CollaboratorUnavailable { .. } => Self::service_unavailable(request_id, err.to_string()),
            e if e.is_client_error() => Self::bad_request(request_id, e.to_string()),
            e => {
                tracing::error!(request_id = %request_id, error = %e, "Request failed");
                Self::internal_error(request_id, e.to_string())
            }
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::NotFound { message, .. } => write!(f, "[{}] Not Found: {}", self.request_id, message),
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::InternalError(msg) => write!(f, "[{}] Internal Error: {}", self.request_id, msg),
            ApiErrorKind::ServiceUnavailable(msg) => write!(f, "[{}] Service Unavailable: {}", self.request_id, msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.kind {
            ApiErrorKind::NotFound { code, message } => (StatusCode::NOT_FOUND, *code, message.clone()),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiErrorKind::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
            ApiErrorKind::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone())
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: None,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomState;

    #[test]
    fn test_domain_errors_map_to_status() {
        let err = ApiError::from_arena("r1".into(), &ArenaError::RoomNotFound("x".into()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err = ApiError::from_arena(
            "r2".into(),
            &ArenaError::InvalidTransition {
                from: RoomState::Ended,
                to: RoomState::InProgress,
            },
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = ApiError::from_arena(
            "r3".into(),
            &ArenaError::CollaboratorUnavailable {
                collaborator: "wallet",
                reason: "timeout".into(),
            },
        );
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
