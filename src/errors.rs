use crate::models::upload_session::UploadStatus;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy shared by the session state machine, the session store,
/// the remote storage client and the coordinator.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upload session `{0}` not found")]
    NotFound(Uuid),
    #[error("upload session `{0}` has expired")]
    Expired(Uuid),
    #[error("cannot {operation} an upload in status `{status}`")]
    InvalidState {
        status: UploadStatus,
        operation: &'static str,
    },
    #[error("chunk {received} submitted out of sequence, expected chunk {expected}")]
    OutOfSequence { expected: u32, received: u32 },
    #[error("upload incomplete: {completed} of {total} chunks received")]
    Incomplete { completed: u32, total: u32 },
    #[error("upload session `{0}` was modified concurrently")]
    Conflict(Uuid),
    #[error("remote storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("remote storage protocol error: {0}")]
    StorageProtocolError(String),
    #[error("corrupted upload session record: {0}")]
    CorruptedSession(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Stable machine-readable code surfaced to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidRequest(_) => "invalid_request",
            UploadError::NotFound(_) => "not_found",
            UploadError::Expired(_) => "expired",
            UploadError::InvalidState { .. } => "invalid_state",
            UploadError::OutOfSequence { .. } => "out_of_sequence",
            UploadError::Incomplete { .. } => "incomplete",
            UploadError::Conflict(_) => "conflict",
            UploadError::StorageUnavailable(_) => "storage_unavailable",
            UploadError::StorageProtocolError(_) => "storage_protocol_error",
            UploadError::CorruptedSession(_) | UploadError::Database(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::Expired(_) => StatusCode::GONE,
            UploadError::InvalidState { .. }
            | UploadError::OutOfSequence { .. }
            | UploadError::Incomplete { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::Conflict(_) => StatusCode::CONFLICT,
            UploadError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::StorageProtocolError(_) => StatusCode::BAD_GATEWAY,
            UploadError::CorruptedSession(_) | UploadError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A lightweight wrapper for errors returned from HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match &err {
            // Internal details stay in the logs.
            UploadError::Database(_) | UploadError::CorruptedSession(_) => {
                tracing::error!(error = %err, "upload request failed");
                AppError::internal("internal error")
            }
            _ => AppError::new(err.status(), err.code(), err.to_string()),
        }
    }
}
