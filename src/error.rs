// src/error.rs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Main application error type.
#[derive(Error, Debug)]
pub enum AppError {
    // Validation
    #[error("Validation failed: {field} - {message}")]
    Validation { field: String, message: String },

    // Resources
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    // Authentication
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // Key pool
    #[error("No active keys available in group")]
    NoActiveKeys,

    // Upstream
    #[error("Upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    // Async tasks
    #[error("A task of this kind is already running")]
    TaskInProgress,

    // Storage
    #[error("Store key not found")]
    StoreNotFound,

    #[error("Store operation failed: {message}")]
    Store { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    // Crypto
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    // HTTP and network
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // System
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO operation failed: {message}")]
    Io { message: String },
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// True for the transient SQL contention class that warrants a bounded retry.
    pub fn is_database_locked(&self) -> bool {
        matches!(self, Self::Database { message }
            if message.contains("database is locked") || message.contains("database table is locked"))
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } | Self::StoreNotFound => StatusCode::NOT_FOUND,
            Self::TaskInProgress => StatusCode::CONFLICT,
            Self::NoActiveKeys => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Database { .. }
            | Self::Store { .. }
            | Self::Encryption { .. }
            | Self::Internal { .. }
            | Self::Config { .. }
            | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "request rejected");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind: "proxy_error".to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<deadpool_redis::PoolError> for AppError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidRequest {
            message: format!("Invalid URL: {err}"),
        }
    }
}

impl From<axum::Error> for AppError {
    fn from(err: axum::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

/// Result type alias for the application.
pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// HTTP statuses that justify retrying the request on a different key.
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16, retryable: &[u16]) -> bool {
    retryable.contains(&status)
}

/// Error-message markers that must not count against a key's failure budget:
/// client cancellations, proxy-side connect problems, and upstream rejections
/// of the request content rather than the credential.
const UNCOUNTED_MARKERS: &[&str] = &[
    "request canceled",
    "operation was canceled",
    "client disconnected",
    "connection closed before message completed",
    "error trying to connect",
    "dns error",
    "connect timeout",
    "PROHIBITED_CONTENT",
    "User location is not supported",
    "content_policy_violation",
];

/// Default classification predicate for failure accounting. Deployments may
/// inject their own at pool construction.
pub fn default_uncounted(message: &str) -> bool {
    UNCOUNTED_MARKERS.iter().any(|m| message.contains(m))
}

/// Extracts a human-readable message from an upstream error body.
///
/// Understands the common vendor shapes `{"error": {"message": ...}}`,
/// `{"error": "..."}` and `{"message": "..."}`; falls back to the raw body.
pub fn parse_upstream_error(body: &[u8]) -> String {
    const MAX_RAW: usize = 1024;

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("error").and_then(|e| e.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        // Gemini wraps errors in a top-level array.
        if let Some(msg) = value
            .get(0)
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }

    let raw = String::from_utf8_lossy(body);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "empty error body".to_string();
    }
    trimmed.chars().take(MAX_RAW).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(AppError::NoActiveKeys.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AppError::TaskInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::validation("weight", "out of range").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Authentication { message: "missing key".into() }.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Upstream { status: 429, message: "slow down".into() }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::database("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn locked_detection_matches_sqlite_wording() {
        assert!(AppError::database("database is locked").is_database_locked());
        assert!(!AppError::database("syntax error").is_database_locked());
        assert!(!AppError::NoActiveKeys.is_database_locked());
    }

    #[test]
    fn retryable_statuses_cover_transient_classes() {
        for s in [408, 425, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(s, DEFAULT_RETRYABLE_STATUSES), "{s} should retry");
        }
        for s in [200, 201, 400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(s, DEFAULT_RETRYABLE_STATUSES), "{s} should not retry");
        }
    }

    #[test]
    fn uncounted_markers_skip_failure_accounting() {
        assert!(default_uncounted("request canceled by client"));
        assert!(default_uncounted("dns error: no record found"));
        assert!(default_uncounted("[status 400] PROHIBITED_CONTENT"));
        assert!(!default_uncounted("[status 401] invalid api key"));
        assert!(!default_uncounted("[status 500] internal"));
    }

    #[test]
    fn upstream_error_parsing_handles_vendor_shapes() {
        assert_eq!(
            parse_upstream_error(br#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(parse_upstream_error(br#"{"error":"quota"}"#), "quota");
        assert_eq!(parse_upstream_error(br#"{"message":"nope"}"#), "nope");
        assert_eq!(
            parse_upstream_error(br#"[{"error":{"message":"gemini says no"}}]"#),
            "gemini says no"
        );
        assert_eq!(parse_upstream_error(b"plain text"), "plain text");
        assert_eq!(parse_upstream_error(b"  "), "empty error body");
    }
}
