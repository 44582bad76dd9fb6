//! Admin API server

use axum::http::HeaderValue;
use axum::{middleware, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::routes::create_router;
use super::{track_requests, AppState};
use crate::config::ServerConfig;
use crate::engine::Engine;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to bind to address
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Server error
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// HTTP front end of an [`Engine`]
pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    /// Create a server for the engine
    pub fn new(engine: Arc<Engine>, config: ServerConfig) -> Self {
        Self {
            config,
            state: AppState::new(engine),
        }
    }

    /// Application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    fn cors_layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();

        let allow_origin = if origins.is_empty() {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(origins)
        };
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any)
    }

    /// Build the router with all routes and layers
    pub fn build_router(&self) -> Router {
        create_router(self.state.clone())
            .route_layer(middleware::from_fn(track_requests))
            .layer(self.cors_layer())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self
            .config
            .bind_addr()
            .map_err(|e| ServerError::Config(format!("{e:#}")))?;
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        tracing::info!(%addr, "Admin API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        tracing::info!("Admin API shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineBuilder;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn server(cors_origins: Vec<String>) -> ApiServer {
        let mut config = EngineConfig::default();
        config.storage.snapshot_path = None;
        let engine = Arc::new(EngineBuilder::new(config).build().unwrap());
        ApiServer::new(
            engine,
            ServerConfig {
                cors_origins,
                ..ServerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let router = server(Vec::new()).build_router();
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_with_explicit_origin() {
        let router = server(vec!["https://admin.example.com".to_string()]).build_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "https://admin.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://admin.example.com"
        );
    }

    #[tokio::test]
    async fn test_bind_error_reported() {
        let server = ApiServer::new(
            server(Vec::new()).state().engine,
            ServerConfig {
                host: "not a host".to_string(),
                ..ServerConfig::default()
            },
        );
        let result = server.start_with_shutdown(async {}).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
