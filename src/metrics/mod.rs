//! Prometheus metrics for the orchestration engine and its HTTP binding
//!
//! This module provides metrics tracking for:
//! - Engine: job outcomes, queue depth, admission decisions, circuit state,
//!   cache lookups, alerts, identity pool and platform health
//! - API: request counts and latency per endpoint
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all engine metrics
struct EngineMetrics {
    jobs_enqueued: CounterVec,
    jobs_finished: CounterVec,
    job_duration: HistogramVec,
    queue_depth: GaugeVec,
    admissions: CounterVec,
    in_flight: GaugeVec,
    refill_rate: GaugeVec,
    circuit_open: GaugeVec,
    cache_lookups: CounterVec,
    alerts: CounterVec,
    identities: GaugeVec,
    health_status: GaugeVec,
}

/// Container for HTTP API metrics
struct ApiMetrics {
    requests: CounterVec,
    duration: HistogramVec,
}

lazy_static! {
    // Registration runs once; a failure leaves the set empty
    static ref ENGINE_METRICS: Option<EngineMetrics> = EngineMetrics::register()
        .map_err(|e| tracing::warn!(error = %e, "Engine metrics registration failed"))
        .ok();

    static ref API_METRICS: Option<ApiMetrics> = ApiMetrics::register()
        .map_err(|e| tracing::warn!(error = %e, "API metrics registration failed"))
        .ok();
}

// ============================================================================
// Initialization
// ============================================================================

impl EngineMetrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            jobs_enqueued: register_counter_vec!(
                "ticketwatch_jobs_enqueued_total",
                "Total scrape jobs accepted into the queue",
                &["platform"]
            )?,
            jobs_finished: register_counter_vec!(
                "ticketwatch_jobs_finished_total",
                "Scrape jobs reaching a terminal state",
                &["platform", "outcome"]
            )?,
            job_duration: register_histogram_vec!(
                "ticketwatch_job_duration_seconds",
                "External scrape call duration in seconds",
                &["platform"],
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            )?,
            queue_depth: register_gauge_vec!(
                "ticketwatch_queue_depth",
                "Jobs waiting in the platform queue",
                &["platform"]
            )?,
            admissions: register_counter_vec!(
                "ticketwatch_admissions_total",
                "Admission decisions by platform and result",
                &["platform", "result"]
            )?,
            in_flight: register_gauge_vec!(
                "ticketwatch_in_flight",
                "Operations currently admitted per platform",
                &["platform"]
            )?,
            refill_rate: register_gauge_vec!(
                "ticketwatch_refill_rate",
                "Current token refill rate (requests per second)",
                &["platform"]
            )?,
            circuit_open: register_gauge_vec!(
                "ticketwatch_circuit_open",
                "Whether the platform circuit is open (1 = open, 0 = closed)",
                &["platform"]
            )?,
            cache_lookups: register_counter_vec!(
                "ticketwatch_cache_lookups_total",
                "Result cache lookups by layer and result",
                &["layer", "result"]
            )?,
            alerts: register_counter_vec!(
                "ticketwatch_alerts_total",
                "Watchlist alerts emitted by severity",
                &["severity"]
            )?,
            identities: register_gauge_vec!(
                "ticketwatch_identities",
                "Identities in the pool by status",
                &["status"]
            )?,
            health_status: register_gauge_vec!(
                "ticketwatch_platform_health",
                "Platform health (0 = healthy, 1 = degraded, 2 = critical)",
                &["platform"]
            )?,
        })
    }
}

impl ApiMetrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            requests: register_counter_vec!(
                "ticketwatch_api_requests_total",
                "Total API requests by endpoint and status",
                &["endpoint", "status"]
            )?,
            duration: register_histogram_vec!(
                "ticketwatch_api_request_duration_seconds",
                "API request duration in seconds",
                &["endpoint"],
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            )?,
        })
    }
}

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup. Later calls
/// are no-ops. If metric registration fails, the error is logged and the
/// recording helpers do nothing.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = ticketwatch::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if ENGINE_METRICS.is_none() {
        return Err("engine metrics registration failed".into());
    }
    if API_METRICS.is_none() {
        return Err("API metrics registration failed".into());
    }

    tracing::debug!("Prometheus metrics registered");
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a job accepted into a queue
pub fn record_job_enqueued(platform: &str) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.jobs_enqueued.with_label_values(&[platform]).inc();
    }
}

/// Record a job reaching a terminal state
pub fn record_job_finished(platform: &str, outcome: &str) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.jobs_finished
            .with_label_values(&[platform, outcome])
            .inc();
    }
}

/// Record external call duration
pub fn observe_job_duration(platform: &str, duration_secs: f64) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.job_duration
            .with_label_values(&[platform])
            .observe(duration_secs);
    }
}

/// Update the queue depth gauge
pub fn set_queue_depth(platform: &str, depth: usize) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.queue_depth
            .with_label_values(&[platform])
            .set(depth as f64);
    }
}

/// Record an admission decision (`admitted`, `probe` or a deny reason)
pub fn record_admission(platform: &str, result: &str) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.admissions.with_label_values(&[platform, result]).inc();
    }
}

/// Update per-platform budget gauges
pub fn update_budget(platform: &str, in_flight: usize, refill_rate: f64) {
    let Some(m) = ENGINE_METRICS.as_ref() else {
        return;
    };

    m.in_flight
        .with_label_values(&[platform])
        .set(in_flight as f64);
    m.refill_rate
        .with_label_values(&[platform])
        .set(refill_rate);
}

/// Update circuit state
pub fn set_circuit_open(platform: &str, open: bool) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.circuit_open
            .with_label_values(&[platform])
            .set(if open { 1.0 } else { 0.0 });
    }
}

/// Record a cache lookup
pub fn record_cache_lookup(layer: &str, hit: bool) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        let result = if hit { "hit" } else { "miss" };
        m.cache_lookups.with_label_values(&[layer, result]).inc();
    }
}

/// Record an emitted alert
pub fn record_alert(severity: &str) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.alerts.with_label_values(&[severity]).inc();
    }
}

/// Update identity pool gauges
pub fn update_identity_counts(active: usize, cooling: usize, disabled: usize) {
    let Some(m) = ENGINE_METRICS.as_ref() else {
        return;
    };

    m.identities
        .with_label_values(&["active"])
        .set(active as f64);
    m.identities
        .with_label_values(&["cooling"])
        .set(cooling as f64);
    m.identities
        .with_label_values(&["disabled"])
        .set(disabled as f64);
}

/// Update platform health gauge
pub fn set_health_status(platform: &str, level: u8) {
    if let Some(m) = ENGINE_METRICS.as_ref() {
        m.health_status
            .with_label_values(&[platform])
            .set(f64::from(level));
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = API_METRICS.as_ref() else {
        return;
    };

    let status_str = status.to_string();
    m.requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================
