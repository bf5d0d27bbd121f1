use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::session_lifecycle::SessionError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    time_expired: bool,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// The attempt ran out of time; the session has been auto-submitted.
    TimeExpired(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ExamNotFound | SessionError::InvalidSession => {
                ApiError::NotFound(err.to_string())
            }
            SessionError::NotInProgress
            | SessionError::AlreadyTerminal
            | SessionError::AlreadyCompleted => ApiError::Conflict(err.to_string()),
            SessionError::TimeExpired => ApiError::TimeExpired(err.to_string()),
            SessionError::UnknownQuestion | SessionError::InvalidAnswer(_) => {
                ApiError::BadRequest(err.to_string())
            }
            SessionError::Persistence(store_err) => {
                ApiError::internal(store_err, "Session store operation failed")
            }
        }
    }
}

fn error_body(status: StatusCode, detail: String, time_expired: bool) -> Response {
    (status, Json(ErrorResponse { status: status.as_u16(), detail, time_expired })).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                let mut response =
                    error_body(StatusCode::UNAUTHORIZED, message.to_string(), false);
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::BadRequest(message) => error_body(StatusCode::BAD_REQUEST, message, false),
            ApiError::NotFound(message) => error_body(StatusCode::NOT_FOUND, message, false),
            ApiError::Conflict(message) => error_body(StatusCode::CONFLICT, message, false),
            ApiError::TimeExpired(message) => error_body(StatusCode::GONE, message, true),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, message, false)
            }
        }
    }
}
