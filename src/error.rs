//! Error taxonomy for the metrics pipeline.
//!
//! Validation errors surface to HTTP clients verbatim as `{code, message}`
//! JSON; infrastructure errors are logged with their chain and reported as
//! a generic 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric not found")]
    NotFound,
    #[error("invalid metric type")]
    InvalidType,
    #[error("invalid metric value")]
    InvalidValue,
    #[error("missing value")]
    MissingValue,
    /// Storage failure after the retry layer gave up (either the error was
    /// classified permanent or the backoff deadline was exhausted).
    #[error("storage failure")]
    Storage(#[source] sqlx::Error),
    #[error("snapshot store failure")]
    Snapshot(#[source] std::io::Error),
    #[error("malformed snapshot record")]
    SnapshotDecode(#[source] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

/// JSON error body shared by handlers and middleware.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        code: status.as_u16(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for MetricError {
    fn into_response(self) -> Response {
        let status = match &self {
            MetricError::NotFound => StatusCode::NOT_FOUND,
            MetricError::InvalidType | MetricError::InvalidValue | MetricError::MissingValue => {
                StatusCode::BAD_REQUEST
            }
            MetricError::Storage(err) => {
                tracing::error!(error = %self, source = %err, "storage error");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
            MetricError::Snapshot(_) | MetricError::SnapshotDecode(_) | MetricError::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        error_response(status, self.to_string())
    }
}
