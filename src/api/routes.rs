//! REST API handlers
//!
//! Every engine administrative operation has one route under `/api`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ApiResponse, ApiResult, AppState, ErrorResponse};
use crate::cache::{InvalidationReport, InvalidationTarget, LayerStats, WarmupReport};
use crate::engine::DashboardStats;
use crate::health::HealthReport;
use crate::identity::ProxyHealth;
use crate::metrics;
use crate::plugin::{PluginStatus, PluginTestReport};
use crate::scheduler::{
    CancelOutcome, EnqueueOutcome, JobRecord, JobRequest, SchedulerError, ScrapeJob,
};
use crate::watchlist::{AlertCriteria, AlertEvent, WatchItem, WatchRequest};

const DEFAULT_LIMIT: usize = 50;

// ============================================================================
// Request / Response Types
// ============================================================================

/// Liveness response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub monitoring: bool,
}

/// Monitoring toggle result
#[derive(Debug, Serialize)]
pub struct MonitoringResponse {
    pub monitoring: bool,
    /// False when the call did not change anything
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct IntervalResponse {
    pub seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct ClearCacheRequest {
    #[serde(default = "all_entries")]
    pub target: InvalidationTarget,
    #[serde(default)]
    pub cascade: bool,
}

fn all_entries() -> InvalidationTarget {
    InvalidationTarget::All
}

#[derive(Debug, Default, Deserialize)]
pub struct WarmupRequest {
    #[serde(default)]
    pub layers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed: usize,
}

/// `?limit=` query
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/dashboard", get(dashboard))
        .route("/api/health", get(health_status))
        // Monitoring
        .route("/api/monitoring/start", post(start_monitoring))
        .route("/api/monitoring/stop", post(stop_monitoring))
        .route(
            "/api/monitoring/interval",
            get(get_interval).put(set_interval),
        )
        // Watchlist and alerts
        .route("/api/watchlist", get(list_watchlist).post(add_to_watchlist))
        .route(
            "/api/watchlist/{platform}/{entity}",
            delete(remove_from_watchlist),
        )
        .route("/api/watch-items/{id}", delete(remove_watch_item))
        .route("/api/watch-items/{id}/pause", post(pause_watch_item))
        .route("/api/watch-items/{id}/resume", post(resume_watch_item))
        .route("/api/alerts", get(recent_alerts))
        .route(
            "/api/alerts/thresholds",
            get(get_thresholds).put(set_thresholds),
        )
        // Plugins and identities
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/{platform}/test", post(test_plugin))
        .route("/api/plugins/{platform}/enable", post(enable_plugin))
        .route("/api/plugins/{platform}/disable", post(disable_plugin))
        .route("/api/proxies/test", post(test_all_proxies))
        // Cache
        .route("/api/cache", get(cache_stats))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/cache/warmup", post(warmup_cache))
        // Jobs
        .route("/api/jobs", get(recent_jobs).post(enqueue_job))
        .route("/api/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/api/queues/{platform}", get(queued_jobs))
        .with_state(state)
}

// ============================================================================
// Health & Metrics
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(ApiResponse::success(HealthResponse {
        status: engine.health_status().status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: engine.uptime().as_secs(),
        monitoring: engine.is_monitoring().await,
    }))
}

async fn metrics_handler() -> axum::response::Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to encode metrics: {e}"))),
        )
            .into_response(),
    }
}

async fn dashboard(State(state): State<AppState>) -> ApiResult<DashboardStats> {
    Ok(Json(ApiResponse::success(state.engine.dashboard_stats().await)))
}

async fn health_status(State(state): State<AppState>) -> ApiResult<HealthReport> {
    Ok(Json(ApiResponse::success(state.engine.health_status())))
}

// ============================================================================
// Monitoring Handlers
// ============================================================================

async fn start_monitoring(State(state): State<AppState>) -> ApiResult<MonitoringResponse> {
    let changed = state.engine.start_monitoring().await;
    Ok(Json(ApiResponse::success(MonitoringResponse {
        monitoring: true,
        changed,
    })))
}

async fn stop_monitoring(State(state): State<AppState>) -> ApiResult<MonitoringResponse> {
    let changed = state.engine.stop_monitoring().await;
    Ok(Json(ApiResponse::success(MonitoringResponse {
        monitoring: false,
        changed,
    })))
}

async fn get_interval(State(state): State<AppState>) -> ApiResult<IntervalResponse> {
    Ok(Json(ApiResponse::success(IntervalResponse {
        seconds: state.engine.monitoring_interval(),
    })))
}

async fn set_interval(
    State(state): State<AppState>,
    Json(request): Json<IntervalRequest>,
) -> ApiResult<IntervalResponse> {
    state.engine.set_monitoring_interval(request.seconds)?;
    Ok(Json(ApiResponse::success(IntervalResponse {
        seconds: request.seconds,
    })))
}

// ============================================================================
// Watchlist Handlers
// ============================================================================

async fn list_watchlist(State(state): State<AppState>) -> ApiResult<Vec<WatchItem>> {
    Ok(Json(ApiResponse::success(state.engine.watch_items().await)))
}

async fn add_to_watchlist(
    State(state): State<AppState>,
    Json(request): Json<WatchRequest>,
) -> ApiResult<WatchItem> {
    let item = state.engine.add_to_watchlist(request).await?;
    Ok(Json(ApiResponse::success(item)))
}

async fn remove_from_watchlist(
    State(state): State<AppState>,
    Path((platform, entity)): Path<(String, String)>,
) -> ApiResult<RemovedResponse> {
    let removed = state.engine.remove_from_watchlist(&platform, &entity).await?;
    Ok(Json(ApiResponse::success(RemovedResponse { removed })))
}

async fn remove_watch_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WatchItem> {
    Ok(Json(ApiResponse::success(
        state.engine.remove_watch_item(&id).await?,
    )))
}

async fn pause_watch_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WatchItem> {
    Ok(Json(ApiResponse::success(
        state.engine.watchlist().pause(&id).await?,
    )))
}

async fn resume_watch_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WatchItem> {
    Ok(Json(ApiResponse::success(
        state.engine.watchlist().resume(&id).await?,
    )))
}

async fn recent_alerts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<AlertEvent>> {
    Ok(Json(ApiResponse::success(
        state.engine.recent_alerts(query.limit()),
    )))
}

async fn get_thresholds(State(state): State<AppState>) -> ApiResult<AlertCriteria> {
    Ok(Json(ApiResponse::success(
        state.engine.watchlist().default_criteria(),
    )))
}

async fn set_thresholds(
    State(state): State<AppState>,
    Json(criteria): Json<AlertCriteria>,
) -> ApiResult<AlertCriteria> {
    state.engine.set_alert_thresholds(criteria.clone())?;
    Ok(Json(ApiResponse::success(criteria)))
}

// ============================================================================
// Plugin & Proxy Handlers
// ============================================================================

async fn list_plugins(State(state): State<AppState>) -> ApiResult<BTreeMap<String, PluginStatus>> {
    Ok(Json(ApiResponse::success(state.engine.plugin_statuses())))
}

async fn test_plugin(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<PluginTestReport> {
    Ok(Json(ApiResponse::success(
        state.engine.test_plugin(&platform).await?,
    )))
}

async fn enable_plugin(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<BTreeMap<String, PluginStatus>> {
    state.engine.enable_plugin(&platform)?;
    Ok(Json(ApiResponse::success(state.engine.plugin_statuses())))
}

async fn disable_plugin(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<BTreeMap<String, PluginStatus>> {
    state.engine.disable_plugin(&platform)?;
    Ok(Json(ApiResponse::success(state.engine.plugin_statuses())))
}

async fn test_all_proxies(State(state): State<AppState>) -> ApiResult<Vec<ProxyHealth>> {
    Ok(Json(ApiResponse::success(
        state.engine.test_all_proxies().await,
    )))
}

// ============================================================================
// Cache Handlers
// ============================================================================

async fn cache_stats(State(state): State<AppState>) -> ApiResult<BTreeMap<String, LayerStats>> {
    Ok(Json(ApiResponse::success(state.engine.cache().stats())))
}

async fn clear_cache(
    State(state): State<AppState>,
    Json(request): Json<ClearCacheRequest>,
) -> ApiResult<InvalidationReport> {
    Ok(Json(ApiResponse::success(
        state.engine.clear_cache(&request.target, request.cascade),
    )))
}

async fn warmup_cache(
    State(state): State<AppState>,
    Json(request): Json<WarmupRequest>,
) -> ApiResult<WarmupReport> {
    Ok(Json(ApiResponse::success(
        state.engine.warmup_cache(&request.layers).await?,
    )))
}

// ============================================================================
// Job Handlers
// ============================================================================

async fn recent_jobs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<JobRecord>> {
    Ok(Json(ApiResponse::success(
        state.engine.recent_jobs(query.limit()),
    )))
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<EnqueueOutcome> {
    Ok(Json(ApiResponse::success(state.engine.enqueue(request)?)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ScrapeJob> {
    let job = state
        .engine
        .job(&id)
        .ok_or_else(|| SchedulerError::job_not_found(&id))?;
    Ok(Json(ApiResponse::success(job)))
}

async fn queued_jobs(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Vec<ScrapeJob>> {
    Ok(Json(ApiResponse::success(
        state.engine.queued_jobs(&platform),
    )))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CancelOutcome> {
    Ok(Json(ApiResponse::success(state.engine.cancel(&id)?)))
}

// ============================================================================
// Tests
// ============================================================================
