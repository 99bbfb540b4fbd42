// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Global Application Error Enum.
/// Centralizes error handling and mapping to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    // 500 Internal Server Error
    InternalServerError(String),

    // 400 Bad Request: malformed input or an identifier that does not resolve.
    Validation(String),

    // 401 Unauthorized
    AuthError(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict (duplicate natural key, stale version)
    Conflict(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InternalServerError(_) => ErrorKind::Internal,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::AuthError(_) => ErrorKind::Auth,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::InternalServerError(msg)
            | AppError::Validation(msg)
            | AppError::AuthError(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for AppError {}

/// Wire-level classification of a failure, reported per record in batch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    Conflict,
    Internal,
}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };
        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Converts `sqlx::Error` into `AppError`.
/// Unique violations become `Conflict` so callers can fall back to an update.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => AppError::NotFound(err.to_string()),
            _ => AppError::InternalServerError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errs: validator::ValidationErrors) -> Self {
        AppError::Validation(errs.to_string())
    }
}

/// One record that could not be processed inside a batch.
///
/// Carries the record's natural key so the caller can retry it on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub key: String,
    /// Set for report records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reg_number: Option<String>,
    pub kind: ErrorKind,
    pub reason: String,
}

impl RecordFailure {
    pub fn new(key: impl Into<String>, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reg_number: None,
            kind,
            reason: reason.into(),
        }
    }

    pub fn from_error(key: impl Into<String>, err: &AppError) -> Self {
        Self::new(key, err.kind(), err.message())
    }

    pub fn for_student(mut self, reg_number: impl Into<String>) -> Self {
        self.reg_number = Some(reg_number.into());
        self
    }
}
