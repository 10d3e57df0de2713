use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Rejections produced by the session registry and the gateway.
///
/// Capacity and state-conflict errors are returned to the initiating
/// connection and never retried by the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Broadcast {0} is not live")]
    BroadcastNotFound(String),
    #[error("Broadcast {0} already has a broadcaster attached")]
    BroadcasterConflict(String),
    #[error("Connection already joined as {0}")]
    RoleAlreadySet(String),
    #[error("Connection has not joined a broadcast")]
    NotJoined,
    #[error("Only the broadcaster may do that")]
    NotBroadcaster,
    #[error("Call {0} is not waiting in the queue")]
    CallNotFound(String),
    #[error("You already have a call pending or on air")]
    CallAlreadyPending,
    #[error("Call {0} is not on air")]
    CallNotActive(String),
    #[error("Audio source {0} does not exist")]
    SourceNotFound(String),
    #[error("Broadcast has reached its limit of {0} audio sources")]
    SourceCapacityExceeded(usize),
    #[error("Broadcast has reached its limit of {0} callers on air")]
    CallerCapacityExceeded(usize),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl SessionError {
    /// Stable machine-readable code sent alongside the human-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BroadcastNotFound(_) => "BROADCAST_NOT_FOUND",
            Self::BroadcasterConflict(_) => "BROADCASTER_CONFLICT",
            Self::RoleAlreadySet(_) => "ROLE_ALREADY_SET",
            Self::NotJoined => "NOT_JOINED",
            Self::NotBroadcaster => "NOT_BROADCASTER",
            Self::CallNotFound(_) => "CALL_NOT_FOUND",
            Self::CallAlreadyPending => "CALL_ALREADY_PENDING",
            Self::CallNotActive(_) => "CALL_NOT_ACTIVE",
            Self::SourceNotFound(_) => "SOURCE_NOT_FOUND",
            Self::SourceCapacityExceeded(_) => "SOURCE_CAPACITY_EXCEEDED",
            Self::CallerCapacityExceeded(_) => "CALLER_CAPACITY_EXCEEDED",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::BroadcastNotFound(_)
            | SessionError::CallNotFound(_)
            | SessionError::SourceNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::CONFLICT,
        };
        Self {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
