//! HTTP-facing error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use errly_store::StoreError;
use thiserror::Error;

/// Errors surfaced by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Bad user input; the reason is shown to the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or expired session, or bad ingestion token.
    #[error("unauthorized")]
    Unauthorized,

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The push hub is at its client capacity.
    #[error("too many connected clients")]
    Overloaded,

    /// A store invariant was violated; logged at error level.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Invariant(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvariantViolation(what) => Self::Invariant(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details are logged, not shown.
        let message = match &self {
            Self::Validation(msg) => msg.clone(),
            Self::Unauthorized => "unauthorized".to_owned(),
            Self::NotFound(what) => format!("not found: {what}"),
            Self::Overloaded => "too many connected clients".to_owned(),
            Self::Invariant(detail) => {
                tracing::error!(detail = %detail, "store invariant violated");
                "internal server error".to_owned()
            }
            Self::Internal(detail) => {
                tracing::error!(detail = %detail, "request failed");
                "internal server error".to_owned()
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Overloaded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Invariant("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn store_errors_map_to_api_errors() {
        let err: ApiError = StoreError::not_found("group 1").into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = StoreError::invariant("row vanished").into();
        assert!(matches!(err, ApiError::Invariant(_)));
    }
}
