//! HTTP API error type.
//!
//! Every handler failure becomes a JSON body `{"error": "..."}` with a status
//! code derived from the command error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::commands::CommandError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request conflicts with current state (precondition or lost race).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match &err {
            CommandError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            CommandError::Invalid(msg) => ApiError::BadRequest(msg.clone()),
            CommandError::Precondition(_) | CommandError::Conflict(_) => {
                ApiError::Conflict(err.to_string())
            }
            CommandError::Unavailable => ApiError::Unavailable(err.to_string()),
            CommandError::Internal(msg) => ApiError::InternalError(msg.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}
