//! Error types for the request optimizer
//!
//! Provides unified error handling using thiserror.
//!
//! - [`CacheError`] covers cache plumbing (backend, encoding) and is always
//!   recovered inside the optimizer.
//! - [`OptimizeError`] is what callers of `optimize` can observe.
//! - [`ApiError`] is the HTTP-facing error of the admin API.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Cache Error Enum ==
/// Failures of the cache layer. Never surfaced to `optimize` callers.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The key-value backend could not be reached
    #[error("Cache backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A payload could not be encoded for storage or decoded after retrieval
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// == Optimize Error Enum ==
/// Caller-visible outcome of a failed `optimize` call.
///
/// Cloneable so that a single failed execution can be fanned out to every
/// joined waiter unchanged.
#[derive(Error, Debug, Clone)]
pub enum OptimizeError {
    /// The wrapped business operation failed
    #[error("{0}")]
    Operation(Arc<anyhow::Error>),

    /// An in-flight execution did not settle within its maximum lifetime
    #[error("Deduplicated operation for key '{key}' did not settle within {timeout_ms}ms")]
    DeduplicationTimeout { key: String, timeout_ms: u64 },
}

impl OptimizeError {
    /// Wraps a business error.
    pub fn operation(err: anyhow::Error) -> Self {
        OptimizeError::Operation(Arc::new(err))
    }

    /// Returns the business error, if this is an operation failure.
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            OptimizeError::Operation(err) => Some(err.as_ref()),
            OptimizeError::DeduplicationTimeout { .. } => None,
        }
    }

    /// True when two errors originate from the same shared failure.
    pub fn same_failure(&self, other: &OptimizeError) -> bool {
        match (self, other) {
            (OptimizeError::Operation(a), OptimizeError::Operation(b)) => Arc::ptr_eq(a, b),
            (
                OptimizeError::DeduplicationTimeout { key: a, .. },
                OptimizeError::DeduplicationTimeout { key: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

// == Api Error Enum ==
/// Error type of the admin HTTP API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An optimized operation failed
    #[error(transparent)]
    Optimize(#[from] OptimizeError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Optimize(OptimizeError::DeduplicationTimeout { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Optimize(OptimizeError::Operation(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the admin API.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_display_is_verbatim() {
        let err = OptimizeError::operation(anyhow::anyhow!("upstream exploded"));
        assert_eq!(err.to_string(), "upstream exploded");
        assert!(err.operation_error().is_some());
    }

    #[test]
    fn test_clones_share_the_same_failure() {
        let err = OptimizeError::operation(anyhow::anyhow!("boom"));
        let cloned = err.clone();
        assert!(err.same_failure(&cloned));

        let other = OptimizeError::operation(anyhow::anyhow!("boom"));
        assert!(!err.same_failure(&other));
    }

    #[test]
    fn test_api_error_status_codes() {
        let resp = ApiError::InvalidRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let timeout = OptimizeError::DeduplicationTimeout {
            key: "k".into(),
            timeout_ms: 10,
        };
        let resp = ApiError::from(timeout).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
