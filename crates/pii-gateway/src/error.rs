//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pii_common::ScanError;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request-level scan failure
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// Reload notification body is not a rule bundle
    #[error("invalid rule bundle: {0}")]
    InvalidBundle(String),
    /// Header value could not be interpreted
    #[error("invalid header {name}: {message}")]
    InvalidHeader {
        /// Header name
        name: &'static str,
        /// What was wrong
        message: String,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    /// Status code for the error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Scan(ScanError::OversizedPayload { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Scan(ScanError::MalformedDocument(_)) => StatusCode::BAD_REQUEST,
            Self::Scan(ScanError::CapacityExceeded) => StatusCode::SERVICE_UNAVAILABLE,
            // Absorbed into degraded results by the service; never returned.
            Self::Scan(ScanError::DeadlineExceeded | ScanError::NoActiveRuleset) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::InvalidBundle(_) | Self::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Scan(e) => e.code(),
            Self::InvalidBundle(_) => "invalid_bundle",
            Self::InvalidHeader { .. } => "invalid_header",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
