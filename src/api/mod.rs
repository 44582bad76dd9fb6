//! Admin HTTP API
//!
//! JSON binding of the engine's administrative operations plus `/health`
//! and `/metrics`. Handlers live in [`routes`]; [`server::ApiServer`]
//! applies the trace, CORS and metrics layers and serves with graceful
//! shutdown.

pub mod routes;
pub mod server;

pub use routes::create_router;
pub use server::{ApiServer, ServerError};

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::engine::Engine;
use crate::error::Error;
use crate::metrics;
use crate::utils::error::{PluginError, PoolError, WatchlistError};
use crate::scheduler::SchedulerError;

// ============================================================================
// App State
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

/// Engine error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// HTTP status for an engine error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Watchlist(WatchlistError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Watchlist(_) => StatusCode::BAD_REQUEST,
        Error::Plugin(PluginError::NotRegistered(_)) => StatusCode::NOT_FOUND,
        Error::Plugin(PluginError::Disabled(_)) => StatusCode::CONFLICT,
        Error::Scheduler(SchedulerError::JobNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Scheduler(SchedulerError::AlreadyTerminal { .. }) => StatusCode::CONFLICT,
        Error::Scheduler(SchedulerError::InvalidJob { .. }) => StatusCode::BAD_REQUEST,
        Error::Scheduler(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Pool(PoolError::Exhausted { .. }) | Error::Admission(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Cache(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "API request rejected");
        }
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

/// Handler result type
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Middleware
// ============================================================================

/// Record request count and latency per matched route
pub async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert!(response.data.is_some());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&WatchlistError::NotFound("w-1".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&PluginError::Disabled("stubhub".into()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&SchedulerError::queue_full("stubhub", 10).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&Error::config("bad")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::other("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
