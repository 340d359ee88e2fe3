use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::conversation::ChatError;
use crate::core::session::SessionError;

/// Error returned by an HTTP handler before any streaming starts.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            ChatError::EmptyPrompt => StatusCode::BAD_REQUEST,
            ChatError::Flagged => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Superseded | ChatError::NothingToRetry => StatusCode::CONFLICT,
            ChatError::Guard(_) | ChatError::Backend(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::UnknownPersona(_) | SessionError::UnknownModel(_) => StatusCode::NOT_FOUND,
            SessionError::EmptySelection
            | SessionError::TooManyPersonas { .. }
            | SessionError::DuplicatePersona(_) => StatusCode::BAD_REQUEST,
            SessionError::Backend(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}
