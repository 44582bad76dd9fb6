//! Platform health monitoring
//!
//! Every finished scrape attempt is recorded as a sample for its platform.
//! Samples live in a rolling window bounded both by count and by age, and
//! the window's success rate classifies the platform:
//!
//! | Success rate | Status |
//! |---|---|
//! | >= 90% | healthy |
//! | 50% - 90% | degraded |
//! | < 50% | critical |
//!
//! A new status only takes effect after `hysteresis` consecutive readings
//! agree, so a single bad sample never flips a platform. Entering
//! `critical` opens the governor circuit for the platform; returning to
//! `healthy` closes it again.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::admission::{AdmissionGovernor, CircuitState};
use crate::clock::SharedClock;
use crate::metrics;
use crate::utils::percentile;

// ============================================================================
// Configuration
// ============================================================================

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Maximum samples kept per platform
    pub window_size: usize,

    /// Maximum sample age (seconds)
    pub window_secs: u64,

    /// Samples required before the window is classified
    pub min_samples: usize,

    /// Consecutive agreeing readings required to change status
    pub hysteresis: u32,

    /// Success rate at or above which a platform is healthy
    pub healthy_threshold: f64,

    /// Success rate below which a platform is critical
    pub critical_threshold: f64,

    /// Average latency considered slow (milliseconds)
    pub high_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            window_secs: 900,
            min_samples: 5,
            hysteresis: 3,
            healthy_threshold: 0.9,
            critical_threshold: 0.5,
            high_latency_ms: 5000,
        }
    }
}

impl HealthConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 || self.min_samples == 0 {
            return Err("health.window_size and health.min_samples must be positive".to_string());
        }
        if self.min_samples > self.window_size {
            return Err("health.min_samples must not exceed health.window_size".to_string());
        }
        if !(0.0..=1.0).contains(&self.critical_threshold)
            || !(0.0..=1.0).contains(&self.healthy_threshold)
            || self.critical_threshold > self.healthy_threshold
        {
            return Err(
                "health thresholds must satisfy 0 <= critical <= healthy <= 1".to_string(),
            );
        }
        if self.hysteresis == 0 {
            return Err("health.hysteresis must be at least 1".to_string());
        }
        Ok(())
    }

    /// Classify a success rate
    pub fn classify(&self, success_rate: f64) -> HealthStatus {
        if success_rate >= self.healthy_threshold {
            HealthStatus::Healthy
        } else if success_rate >= self.critical_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Platform health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }

    /// Numeric level for metrics
    pub fn level(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Critical => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one scrape attempt as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Success,
    Failure,
    /// Bot detection, 429 or 403
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    outcome: SampleOutcome,
    latency_ms: u64,
}

/// Health events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    StatusChanged {
        platform: String,
        from: HealthStatus,
        to: HealthStatus,
        at: DateTime<Utc>,
    },
    JobFailed {
        platform: String,
        job_id: String,
        error: String,
        at: DateTime<Utc>,
    },
}

// ============================================================================
// Health Record
// ============================================================================

/// Rolling health state of one platform
#[derive(Debug, Clone)]
pub struct HealthRecord {
    samples: VecDeque<Sample>,
    status: HealthStatus,
    pending: Option<(HealthStatus, u32)>,
    last_change: Option<DateTime<Utc>>,
    failed_jobs: VecDeque<DateTime<Utc>>,
    exhausted: VecDeque<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            status: HealthStatus::Healthy,
            pending: None,
            last_change: None,
            failed_jobs: VecDeque::new(),
            exhausted: VecDeque::new(),
        }
    }
}

impl HealthRecord {
    fn prune(&mut self, config: &HealthConfig, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(config.window_secs as i64);
        while self.samples.len() > config.window_size {
            self.samples.pop_front();
        }
        while self.samples.front().is_some_and(|s| s.at < horizon) {
            self.samples.pop_front();
        }
        while self.failed_jobs.front().is_some_and(|at| *at < horizon) {
            self.failed_jobs.pop_front();
        }
        while self.exhausted.front().is_some_and(|at| *at < horizon) {
            self.exhausted.pop_front();
        }
    }

    fn count(&self, outcome: SampleOutcome) -> usize {
        self.samples.iter().filter(|s| s.outcome == outcome).count()
    }

    /// Success rate over the window; 1.0 without samples
    pub fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            1.0
        } else {
            self.count(SampleOutcome::Success) as f64 / self.samples.len() as f64
        }
    }

    /// Current status
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    fn latencies(&self) -> Vec<u64> {
        self.samples.iter().map(|s| s.latency_ms).collect()
    }

    /// Feed the latest reading; returns the previous status on a transition
    fn evaluate(&mut self, config: &HealthConfig, now: DateTime<Utc>) -> Option<HealthStatus> {
        if self.samples.len() < config.min_samples {
            self.pending = None;
            return None;
        }
        let reading = config.classify(self.success_rate());
        if reading == self.status {
            self.pending = None;
            return None;
        }

        let streak = match self.pending {
            Some((candidate, count)) if candidate == reading => count + 1,
            _ => 1,
        };
        if streak >= config.hysteresis {
            let previous = self.status;
            self.status = reading;
            self.pending = None;
            self.last_change = Some(now);
            Some(previous)
        } else {
            self.pending = Some((reading, streak));
            None
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// Health of one platform
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformHealth {
    pub platform: String,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub samples: usize,
    pub successes: usize,
    pub failures: usize,
    pub rejections: usize,
    pub avg_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub circuit: CircuitState,
    pub failed_jobs: usize,
    pub last_change: Option<DateTime<Utc>>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Health of every platform
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst platform status
    pub status: HealthStatus,
    pub platforms: BTreeMap<String, PlatformHealth>,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Monitor
// ============================================================================

/// Aggregates per-platform outcomes and drives the circuit breaker
#[derive(Debug)]
pub struct HealthMonitor {
    records: DashMap<String, HealthRecord>,
    config: HealthConfig,
    clock: SharedClock,
    governor: Option<Arc<AdmissionGovernor>>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    /// Create a monitor
    pub fn new(config: HealthConfig, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: DashMap::new(),
            config,
            clock,
            governor: None,
            events,
        }
    }

    /// Drive the governor's circuit from status transitions
    pub fn with_governor(mut self, governor: Arc<AdmissionGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Monitor configuration
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Subscribe to health events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Record one attempt outcome; returns the new status on a transition
    pub fn record(
        &self,
        platform: &str,
        outcome: SampleOutcome,
        latency: std::time::Duration,
    ) -> Option<HealthStatus> {
        let now = self.clock.now();
        let transition = {
            let mut record = self.records.entry(platform.to_string()).or_default();
            record.samples.push_back(Sample {
                at: now,
                outcome,
                latency_ms: latency.as_millis() as u64,
            });
            record.prune(&self.config, now);
            let transition = record
                .evaluate(&self.config, now)
                .map(|previous| (previous, record.status));
            // Circuit follows status in the order records apply
            if let Some((_, to)) = transition {
                self.apply_circuit(platform, to);
            }
            transition
        };

        let (from, to) = transition?;
        self.on_transition(platform, from, to, now);
        Some(to)
    }

    fn apply_circuit(&self, platform: &str, status: HealthStatus) {
        let Some(governor) = &self.governor else {
            return;
        };
        match status {
            HealthStatus::Critical => governor.open_circuit(platform),
            HealthStatus::Healthy => governor.close_circuit(platform),
            HealthStatus::Degraded => {}
        }
    }

    fn on_transition(
        &self,
        platform: &str,
        from: HealthStatus,
        to: HealthStatus,
        at: DateTime<Utc>,
    ) {
        match to {
            HealthStatus::Critical => {
                tracing::warn!(platform = %platform, from = %from, "Platform health critical")
            }
            _ => tracing::info!(
                platform = %platform,
                from = %from,
                to = %to,
                "Platform health changed"
            ),
        }
        metrics::set_health_status(platform, to.level());

        // No subscribers is fine
        let _ = self.events.send(HealthEvent::StatusChanged {
            platform: platform.to_string(),
            from,
            to,
            at,
        });
    }

    /// Surface a job that exhausted its attempts or failed permanently
    pub fn record_job_failure(&self, platform: &str, job_id: &str, error: &str) {
        let now = self.clock.now();
        {
            let mut record = self.records.entry(platform.to_string()).or_default();
            record.failed_jobs.push_back(now);
            record.prune(&self.config, now);
        }
        let _ = self.events.send(HealthEvent::JobFailed {
            platform: platform.to_string(),
            job_id: job_id.to_string(),
            error: error.to_string(),
            at: now,
        });
    }

    /// Note that no identity was available for the platform
    pub fn record_exhausted(&self, platform: &str) {
        let now = self.clock.now();
        let mut record = self.records.entry(platform.to_string()).or_default();
        record.exhausted.push_back(now);
        record.prune(&self.config, now);
    }

    /// Current status of a platform; unknown platforms are healthy
    pub fn status(&self, platform: &str) -> HealthStatus {
        self.records
            .get(platform)
            .map_or(HealthStatus::Healthy, |r| r.status)
    }

    /// Platforms with recorded state
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        platforms.sort();
        platforms
    }

    /// Detailed health of one platform
    pub fn platform_health(&self, platform: &str) -> PlatformHealth {
        let now = self.clock.now();
        let record = {
            let mut record = self.records.entry(platform.to_string()).or_default();
            record.prune(&self.config, now);
            record.clone()
        };
        let circuit = self
            .governor
            .as_ref()
            .map_or(CircuitState::Closed, |g| g.circuit_state(platform));

        let latencies = record.latencies();
        let avg_latency_ms = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<u64>() / latencies.len() as u64);
        let p95_latency_ms = percentile(&latencies, 95.0);
        let success_rate = record.success_rate();
        let rejections = record.count(SampleOutcome::Rejected);

        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if !record.samples.is_empty() && success_rate < self.config.healthy_threshold {
            issues.push(format!("Low success rate: {:.1}%", success_rate * 100.0));
            recommendations
                .push("Lower the request rate or rotate identities more aggressively".to_string());
        }
        if let Some(avg) = avg_latency_ms.filter(|avg| *avg > self.config.high_latency_ms) {
            issues.push(format!("Slow response time: {avg}ms"));
            recommendations.push("Check proxy health or raise the operation timeout".to_string());
        }
        if rejections > 0 {
            issues.push(format!("{rejections} requests rejected by bot detection in window"));
            recommendations.push("Expand the identity pool or reduce concurrency".to_string());
        }
        if circuit == CircuitState::Open {
            issues.push("Circuit open: only probe requests are admitted".to_string());
            recommendations.push(
                "Wait for probes to recover the platform or disable its plugin".to_string(),
            );
        }
        if !record.exhausted.is_empty() {
            issues.push(format!(
                "Identity pool exhausted {} times in window",
                record.exhausted.len()
            ));
            recommendations.push("Add identities or lower the rotation spacing".to_string());
        }
        if !record.failed_jobs.is_empty() {
            issues.push(format!(
                "{} jobs failed after exhausting retries",
                record.failed_jobs.len()
            ));
        }

        PlatformHealth {
            platform: platform.to_string(),
            status: record.status,
            success_rate,
            samples: record.samples.len(),
            successes: record.count(SampleOutcome::Success),
            failures: record.count(SampleOutcome::Failure),
            rejections,
            avg_latency_ms,
            p95_latency_ms,
            circuit,
            failed_jobs: record.failed_jobs.len(),
            last_change: record.last_change,
            issues,
            recommendations,
        }
    }

    /// Health of every known platform plus the given ones
    pub fn report(&self, extra_platforms: &[String]) -> HealthReport {
        let mut names = self.platforms();
        names.extend(extra_platforms.iter().cloned());
        names.sort();
        names.dedup();

        let platforms: BTreeMap<String, PlatformHealth> = names
            .into_iter()
            .map(|name| {
                let health = self.platform_health(&name);
                (name, health)
            })
            .collect();
        let status = platforms
            .values()
            .map(|p| p.status)
            .max()
            .unwrap_or_default();

        HealthReport {
            status,
            platforms,
            generated_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::clock::ManualClock;
    use crate::utils::error::{AdmissionError, DenyReason};
    use std::time::Duration as StdDuration;

    const MS: StdDuration = StdDuration::from_millis(100);

    fn monitor(clock: &ManualClock) -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default(), Arc::new(clock.clone()))
    }

    #[test]
    fn test_classify_thresholds() {
        let config = HealthConfig::default();
        assert_eq!(config.classify(1.0), HealthStatus::Healthy);
        assert_eq!(config.classify(0.9), HealthStatus::Healthy);
        assert_eq!(config.classify(0.7), HealthStatus::Degraded);
        assert_eq!(config.classify(0.5), HealthStatus::Degraded);
        assert_eq!(config.classify(0.49), HealthStatus::Critical);
    }

    #[test]
    fn test_consecutive_failures_reach_critical() {
        let clock = ManualClock::starting_now();
        let monitor = monitor(&clock);

        let mut transitions = Vec::new();
        for _ in 0..10 {
            if let Some(status) = monitor.record("stubhub", SampleOutcome::Failure, MS) {
                transitions.push(status);
            }
        }
        assert_eq!(transitions, vec![HealthStatus::Critical]);
        assert_eq!(monitor.status("stubhub"), HealthStatus::Critical);
    }

    #[test]
    fn test_single_bad_reading_does_not_flip() {
        let clock = ManualClock::starting_now();
        let config = HealthConfig {
            window_size: 10,
            min_samples: 5,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, Arc::new(clock));

        for _ in 0..9 {
            monitor.record("viagogo", SampleOutcome::Success, MS);
        }
        // 9/10 still healthy, then 8/10 gives one degraded reading
        monitor.record("viagogo", SampleOutcome::Failure, MS);
        monitor.record("viagogo", SampleOutcome::Failure, MS);
        assert_eq!(monitor.status("viagogo"), HealthStatus::Healthy);
        monitor.record("viagogo", SampleOutcome::Success, MS);
        monitor.record("viagogo", SampleOutcome::Success, MS);
        assert_eq!(monitor.status("viagogo"), HealthStatus::Healthy);
    }

    #[test]
    fn test_critical_opens_circuit_and_healthy_closes_it() {
        let clock = ManualClock::starting_now();
        let governor = Arc::new(AdmissionGovernor::new(
            AdmissionConfig::default(),
            Arc::new(clock.clone()),
        ));
        let config = HealthConfig {
            window_size: 10,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, Arc::new(clock.clone()))
            .with_governor(Arc::clone(&governor));

        for _ in 0..10 {
            monitor.record("stubhub", SampleOutcome::Failure, MS);
        }
        assert_eq!(governor.circuit_state("stubhub"), CircuitState::Open);
        assert!(matches!(
            governor.try_admit("stubhub"),
            Err(AdmissionError::Denied {
                reason: DenyReason::CircuitOpen,
                ..
            })
        ));

        for _ in 0..12 {
            monitor.record("stubhub", SampleOutcome::Success, MS);
        }
        assert_eq!(monitor.status("stubhub"), HealthStatus::Healthy);
        assert_eq!(governor.circuit_state("stubhub"), CircuitState::Closed);
        assert!(governor.try_admit("stubhub").is_ok());
    }

    #[test]
    fn test_circuit_tracks_status_under_concurrent_records() {
        let clock = ManualClock::starting_now();
        let governor = Arc::new(AdmissionGovernor::new(
            AdmissionConfig::default(),
            Arc::new(clock.clone()),
        ));
        let config = HealthConfig {
            window_size: 10,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, Arc::new(clock.clone()))
            .with_governor(Arc::clone(&governor));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let monitor = &monitor;
                scope.spawn(move || {
                    for i in 0..200 {
                        let outcome = if (i / 15 + worker) % 2 == 0 {
                            SampleOutcome::Failure
                        } else {
                            SampleOutcome::Success
                        };
                        monitor.record("stubhub", outcome, MS);
                    }
                });
            }
        });

        for _ in 0..20 {
            monitor.record("stubhub", SampleOutcome::Failure, MS);
        }
        assert_eq!(monitor.status("stubhub"), HealthStatus::Critical);
        assert_eq!(governor.circuit_state("stubhub"), CircuitState::Open);

        for _ in 0..20 {
            monitor.record("stubhub", SampleOutcome::Success, MS);
        }
        assert_eq!(monitor.status("stubhub"), HealthStatus::Healthy);
        assert_eq!(governor.circuit_state("stubhub"), CircuitState::Closed);
    }

    #[test]
    fn test_old_samples_expire() {
        let clock = ManualClock::starting_now();
        let monitor = monitor(&clock);
        for _ in 0..5 {
            monitor.record("stubhub", SampleOutcome::Failure, MS);
        }
        clock.advance(Duration::minutes(20));
        let health = monitor.platform_health("stubhub");
        assert_eq!(health.samples, 0);
        assert_eq!(health.success_rate, 1.0);
    }

    #[test]
    fn test_report_issues_and_latency() {
        let clock = ManualClock::starting_now();
        let monitor = monitor(&clock);
        for _ in 0..4 {
            monitor.record("stubhub", SampleOutcome::Success, StdDuration::from_millis(8000));
        }
        monitor.record("stubhub", SampleOutcome::Rejected, StdDuration::from_millis(8000));
        monitor.record_exhausted("stubhub");

        let health = monitor.platform_health("stubhub");
        assert_eq!(health.avg_latency_ms, Some(8000));
        assert_eq!(health.p95_latency_ms, Some(8000));
        assert_eq!(health.rejections, 1);
        assert!(health.issues.iter().any(|i| i.contains("Low success rate")));
        assert!(health.issues.iter().any(|i| i.contains("Slow response")));
        assert!(health.issues.iter().any(|i| i.contains("exhausted")));
        assert!(!health.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_transition_broadcast() {
        let clock = ManualClock::starting_now();
        let monitor = monitor(&clock);
        let mut events = monitor.subscribe();

        for _ in 0..10 {
            monitor.record("stubhub", SampleOutcome::Failure, MS);
        }
        monitor.record_job_failure("stubhub", "job-1", "timeout");

        match events.recv().await.unwrap() {
            HealthEvent::StatusChanged { platform, to, .. } => {
                assert_eq!(platform, "stubhub");
                assert_eq!(to, HealthStatus::Critical);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            HealthEvent::JobFailed { .. }
        ));
    }

    #[test]
    fn test_report_overall_is_worst() {
        let clock = ManualClock::starting_now();
        let monitor = monitor(&clock);
        for _ in 0..10 {
            monitor.record("stubhub", SampleOutcome::Failure, MS);
            monitor.record("viagogo", SampleOutcome::Success, MS);
        }
        let report = monitor.report(&["ticketmaster".to_string()]);
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.platforms.len(), 3);
        assert_eq!(report.platforms["ticketmaster"].status, HealthStatus::Healthy);
    }
}
