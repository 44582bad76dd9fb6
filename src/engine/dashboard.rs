//! Dashboard views
//!
//! Every figure here is derived from live scheduler, governor, health and
//! pool state at the time of the call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::admission::CircuitState;
use crate::cache::LayerStats;
use crate::health::HealthStatus;
use crate::identity::PoolStats;
use crate::scheduler::{JobCounters, JobRecord};
use crate::watchlist::{AlertEvent, WatchlistStats};

/// Per-platform dashboard row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformDashboard {
    pub platform: String,
    pub plugin_enabled: bool,
    pub health: HealthStatus,
    pub circuit: CircuitState,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub refill_rate: f64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<u64>,
    pub samples: usize,
    pub jobs: JobCounters,
}

/// Aggregated engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub monitoring: bool,
    pub monitoring_interval_secs: u64,

    /// Overall health (worst platform)
    pub health: HealthStatus,

    /// Sample-weighted success rate over every platform window
    pub success_rate: f64,

    /// Sample-weighted average latency
    pub avg_latency_ms: Option<u64>,

    pub queue_depth: usize,
    pub active_identities: usize,
    pub identities: PoolStats,
    pub platforms: BTreeMap<String, PlatformDashboard>,
    pub cache: BTreeMap<String, LayerStats>,
    pub watchlist: WatchlistStats,
    pub recent_alerts: Vec<AlertEvent>,
    pub recent_jobs: Vec<JobRecord>,
}

/// Combine per-platform rates and latencies weighted by sample count
///
/// Platforms without samples are ignored. With no samples at all the
/// success rate is reported as 1.0, matching an empty health window.
pub(crate) fn weighted_totals<'a>(
    rows: impl IntoIterator<Item = &'a PlatformDashboard>,
) -> (f64, Option<u64>) {
    let mut samples = 0usize;
    let mut successes = 0.0;
    let mut latency_weight = 0usize;
    let mut latency_sum = 0u128;

    for row in rows {
        if row.samples == 0 {
            continue;
        }
        samples += row.samples;
        successes += row.success_rate * row.samples as f64;
        if let Some(avg) = row.avg_latency_ms {
            latency_weight += row.samples;
            latency_sum += u128::from(avg) * row.samples as u128;
        }
    }

    let rate = if samples == 0 {
        1.0
    } else {
        successes / samples as f64
    };
    let latency = (latency_weight > 0)
        .then(|| u64::try_from(latency_sum / latency_weight as u128).unwrap_or(u64::MAX));
    (rate, latency)
}
