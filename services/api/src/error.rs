//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and how it is
//! rendered as an HTTP response.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use storybook_core::ports::PortError;
use tracing::error;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a failed schema migration at startup.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Port(port) => match port {
                PortError::InsufficientCredits { .. } | PortError::InvalidInput(_) => {
                    StatusCode::BAD_REQUEST
                }
                PortError::Unauthorized => StatusCode::UNAUTHORIZED,
                PortError::Forbidden(_) => StatusCode::FORBIDDEN,
                PortError::NotFound(_) => StatusCode::NOT_FOUND,
                PortError::Conflict(_) => StatusCode::CONFLICT,
                PortError::Upstream(_) | PortError::Unexpected(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Port(PortError::InsufficientCredits { required, current }) => json!({
                "error": "Insufficient credits",
                "required": required,
                "current": current,
            }),
            ApiError::Port(
                e @ (PortError::InvalidInput(_)
                | PortError::NotFound(_)
                | PortError::Forbidden(_)
                | PortError::Conflict(_)),
            ) => json!({ "error": e.to_string() }),
            ApiError::Port(PortError::Unauthorized) => json!({ "error": "Unauthorized" }),
            other => {
                error!(error = %other, "Request failed");
                json!({ "error": "Internal server error" })
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_errors_map_to_status_codes() {
        let cases = [
            (
                PortError::InsufficientCredits { required: 150, current: 50 },
                StatusCode::BAD_REQUEST,
            ),
            (PortError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (PortError::Unauthorized, StatusCode::UNAUTHORIZED),
            (PortError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (PortError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PortError::Conflict("x".into()), StatusCode::CONFLICT),
            (PortError::Upstream("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (port, expected) in cases {
            assert_eq!(ApiError::from(port).into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn insufficient_credits_body_carries_amounts() {
        let response =
            ApiError::from(PortError::InsufficientCredits { required: 150, current: 50 })
                .into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["required"], 150);
        assert_eq!(body["current"], 50);
    }

    #[tokio::test]
    async fn upstream_detail_is_not_leaked() {
        let response =
            ApiError::from(PortError::Upstream("secret key rejected".into())).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("secret"));
    }
}
