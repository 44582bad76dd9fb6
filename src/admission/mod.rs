//! Rate & concurrency governor
//!
//! Every dispatch passes through [`AdmissionGovernor::try_admit`]. Each
//! platform owns a token bucket (governor crate) and a counting semaphore;
//! admission requires both a free concurrency slot and a token. The
//! returned [`AdmissionToken`] holds the semaphore permit, so the in-flight
//! count can never exceed the configured cap and a dropped token always
//! frees its slot.
//!
//! # Adaptive backoff
//!
//! ```text
//!   PlatformRejected ──► rate *= decrease_factor (floored at min_rate)
//!   recovery_window consecutive successes ──► rate += recovery_step (up to configured)
//! ```
//!
//! # Circuit breaker
//!
//! The health monitor opens the circuit for a critical platform. While
//! open, admissions are denied except a single half-open probe every
//! `probe_interval_secs`, which lets fresh samples reach the health
//! monitor so it can close the circuit again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    middleware::StateInformationMiddleware,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::clock::{to_chrono, SharedClock};
use crate::identity::ReleaseOutcome;
use crate::metrics;
use crate::utils::error::{AdmissionError, DenyReason};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, StateInformationMiddleware>;

// ============================================================================
// Configuration
// ============================================================================

/// Rate and concurrency limits for one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformLimits {
    /// Token refill rate (requests per second)
    pub rate_per_sec: f64,

    /// Bucket capacity
    pub burst: u32,

    /// Maximum concurrent operations
    pub max_concurrency: usize,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            rate_per_sec: 2.0,
            burst: 5,
            max_concurrency: 4,
        }
    }
}

/// Governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Limits applied to platforms without an override
    pub default: PlatformLimits,

    /// Per-platform overrides
    pub platforms: HashMap<String, PlatformLimits>,

    /// Floor for the adaptive refill rate
    pub min_rate: f64,

    /// Multiplier applied to the rate on a rejection signal
    pub decrease_factor: f64,

    /// Consecutive successes before the rate is raised again
    pub recovery_window: u32,

    /// Additive rate increase per recovery window
    pub recovery_step: f64,

    /// Interval between half-open probes while the circuit is open (seconds)
    pub probe_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default: PlatformLimits::default(),
            platforms: HashMap::new(),
            min_rate: 0.1,
            decrease_factor: 0.5,
            recovery_window: 20,
            recovery_step: 0.25,
            probe_interval_secs: 30,
        }
    }
}

impl AdmissionConfig {
    /// Limits for a platform
    pub fn limits_for(&self, platform: &str) -> &PlatformLimits {
        self.platforms.get(platform).unwrap_or(&self.default)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        for (name, limits) in std::iter::once(("default", &self.default))
            .chain(self.platforms.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if !(limits.rate_per_sec > 0.0) {
                return Err(format!("admission.{name}.rate_per_sec must be positive"));
            }
            if limits.burst == 0 {
                return Err(format!("admission.{name}.burst must be at least 1"));
            }
            if limits.max_concurrency == 0 {
                return Err(format!("admission.{name}.max_concurrency must be at least 1"));
            }
        }
        if !(self.min_rate > 0.0) {
            return Err("admission.min_rate must be positive".to_string());
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err("admission.decrease_factor must be between 0 and 1".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Budget View
// ============================================================================

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Point-in-time view of a platform's admission budget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformBudget {
    pub platform: String,
    /// Tokens left after the most recent admission (approximate)
    pub tokens_available: u32,
    pub refill_rate: f64,
    pub configured_rate: f64,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub circuit: CircuitState,
    pub enabled: bool,
}

// ============================================================================
// Admission Token
// ============================================================================

/// Proof of admission; holding it occupies one concurrency slot
#[derive(Debug)]
pub struct AdmissionToken {
    platform: String,
    probe: bool,
    admitted_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionToken {
    /// Platform the token was issued for
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Whether this admission is a half-open circuit probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Admission time
    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }
}

// ============================================================================
// Governor
// ============================================================================

struct PlatformState {
    limiter: Arc<Limiter>,
    semaphore: Arc<Semaphore>,
    limits: PlatformLimits,
    current_rate: f64,
    last_remaining: u32,
    success_streak: u32,
    circuit: CircuitState,
    last_probe: Option<DateTime<Utc>>,
    enabled: bool,
}

impl std::fmt::Debug for PlatformState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformState")
            .field("limits", &self.limits)
            .field("current_rate", &self.current_rate)
            .field("circuit", &self.circuit)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl PlatformState {
    fn new(limits: PlatformLimits) -> Self {
        let rate = limits.rate_per_sec;
        Self {
            limiter: Arc::new(build_limiter(rate, limits.burst)),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrency)),
            current_rate: rate,
            last_remaining: limits.burst,
            success_streak: 0,
            circuit: CircuitState::Closed,
            last_probe: None,
            enabled: true,
            limits,
        }
    }

    fn in_flight(&self) -> usize {
        self.limits
            .max_concurrency
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Swap in a limiter for a new rate without handing out a fresh burst
    fn retune(&mut self, rate: f64) {
        let limiter = build_limiter(rate, self.limits.burst);
        let carry = self.last_remaining.min(self.limits.burst);
        let mut drained = 0;
        while drained < self.limits.burst.saturating_sub(carry) && limiter.check().is_ok() {
            drained += 1;
        }
        self.limiter = Arc::new(limiter);
        self.current_rate = rate;
    }
}

fn build_limiter(rate_per_sec: f64, burst: u32) -> Limiter {
    let period = Duration::from_secs_f64(1.0 / rate_per_sec.max(f64::MIN_POSITIVE))
        .max(Duration::from_nanos(1));
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst);
    RateLimiter::direct(quota).with_middleware::<StateInformationMiddleware>()
}

/// Per-platform admission control
#[derive(Debug)]
pub struct AdmissionGovernor {
    platforms: DashMap<String, PlatformState>,
    config: AdmissionConfig,
    clock: SharedClock,
}

impl AdmissionGovernor {
    /// Create a governor
    pub fn new(config: AdmissionConfig, clock: SharedClock) -> Self {
        Self {
            platforms: DashMap::new(),
            config,
            clock,
        }
    }

    /// Governor configuration
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn state(&self, platform: &str) -> dashmap::mapref::one::RefMut<'_, String, PlatformState> {
        self.platforms
            .entry(platform.to_string())
            .or_insert_with(|| PlatformState::new(self.config.limits_for(platform).clone()))
    }

    /// Try to admit one operation for the platform
    ///
    /// Never blocks. A denial is backpressure: the caller leaves its queue
    /// untouched and waits for capacity.
    pub fn try_admit(&self, platform: &str) -> Result<AdmissionToken, AdmissionError> {
        let now = self.clock.now();
        let mut state = self.state(platform);
        let deny = |reason: DenyReason| {
            metrics::record_admission(platform, reason.as_str());
            AdmissionError::Denied {
                platform: platform.to_string(),
                reason,
            }
        };

        if !state.enabled {
            return Err(deny(DenyReason::PlatformDisabled));
        }

        let mut probe = false;
        if state.circuit == CircuitState::Open {
            let interval = to_chrono(Duration::from_secs(self.config.probe_interval_secs));
            let probe_due = state.last_probe.map_or(true, |last| now - last >= interval);
            if !probe_due {
                return Err(deny(DenyReason::CircuitOpen));
            }
            probe = true;
        }

        let permit = match Arc::clone(&state.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(deny(DenyReason::ConcurrencyLimit)),
        };

        let checked = state
            .limiter
            .check()
            .map(|snapshot| snapshot.remaining_burst_capacity());
        match checked {
            Ok(remaining) => state.last_remaining = remaining,
            Err(_) => {
                state.last_remaining = 0;
                return Err(deny(DenyReason::NoTokens));
            }
        }

        if probe {
            state.last_probe = Some(now);
            tracing::info!(platform = %platform, "Half-open probe admitted");
        }
        metrics::record_admission(platform, if probe { "probe" } else { "admitted" });
        metrics::update_budget(platform, state.in_flight(), state.current_rate);

        Ok(AdmissionToken {
            platform: platform.to_string(),
            probe,
            admitted_at: now,
            _permit: permit,
        })
    }

    /// Return an admission token and report the operation outcome
    pub fn release(&self, token: AdmissionToken, outcome: ReleaseOutcome) {
        let platform = token.platform.clone();
        drop(token);

        let mut state = self.state(&platform);
        match outcome {
            ReleaseOutcome::Rejected => {
                state.success_streak = 0;
                let lowered = (state.current_rate * self.config.decrease_factor)
                    .max(self.config.min_rate);
                if lowered < state.current_rate {
                    tracing::info!(
                        platform = %platform,
                        from = state.current_rate,
                        to = lowered,
                        "Platform rejected request, lowering refill rate"
                    );
                    state.retune(lowered);
                }
            }
            ReleaseOutcome::Failure => {
                state.success_streak = 0;
            }
            ReleaseOutcome::Success => {
                state.success_streak += 1;
                let configured = state.limits.rate_per_sec;
                if state.success_streak >= self.config.recovery_window
                    && state.current_rate < configured
                {
                    let raised = (state.current_rate + self.config.recovery_step).min(configured);
                    tracing::info!(
                        platform = %platform,
                        from = state.current_rate,
                        to = raised,
                        "Sustained success, raising refill rate"
                    );
                    state.retune(raised);
                    state.success_streak = 0;
                }
            }
        }
        metrics::update_budget(&platform, state.in_flight(), state.current_rate);
    }

    /// Open the circuit; admissions are denied apart from periodic probes
    pub fn open_circuit(&self, platform: &str) {
        let now = self.clock.now();
        let mut state = self.state(platform);
        if state.circuit != CircuitState::Open {
            state.circuit = CircuitState::Open;
            state.last_probe = Some(now);
            tracing::info!(platform = %platform, "Circuit opened");
            metrics::set_circuit_open(platform, true);
        }
    }

    /// Close the circuit
    pub fn close_circuit(&self, platform: &str) {
        let mut state = self.state(platform);
        if state.circuit != CircuitState::Closed {
            state.circuit = CircuitState::Closed;
            state.last_probe = None;
            tracing::info!(platform = %platform, "Circuit closed");
            metrics::set_circuit_open(platform, false);
        }
    }

    /// Current circuit state
    pub fn circuit_state(&self, platform: &str) -> CircuitState {
        self.platforms
            .get(platform)
            .map_or(CircuitState::Closed, |s| s.circuit)
    }

    /// Enable or disable all admissions for a platform
    pub fn set_enabled(&self, platform: &str, enabled: bool) {
        let mut state = self.state(platform);
        if state.enabled != enabled {
            state.enabled = enabled;
            tracing::info!(platform = %platform, enabled, "Platform admission toggled");
        }
    }

    /// Whether admissions are enabled for a platform
    pub fn is_enabled(&self, platform: &str) -> bool {
        self.platforms.get(platform).map_or(true, |s| s.enabled)
    }

    /// Budget view for one platform
    pub fn snapshot(&self, platform: &str) -> PlatformBudget {
        let state = self.state(platform);
        PlatformBudget {
            platform: platform.to_string(),
            tokens_available: state.last_remaining,
            refill_rate: state.current_rate,
            configured_rate: state.limits.rate_per_sec,
            max_concurrency: state.limits.max_concurrency,
            in_flight: state.in_flight(),
            circuit: state.circuit,
            enabled: state.enabled,
        }
    }

    /// Budget views for every platform seen so far
    pub fn snapshots(&self) -> Vec<PlatformBudget> {
        let mut names: Vec<String> = self.platforms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().map(|name| self.snapshot(name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn governor(limits: PlatformLimits) -> (AdmissionGovernor, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = AdmissionConfig {
            default: limits,
            ..Default::default()
        };
        (AdmissionGovernor::new(config, Arc::new(clock.clone())), clock)
    }

    fn denied(result: Result<AdmissionToken, AdmissionError>) -> DenyReason {
        match result {
            Err(AdmissionError::Denied { reason, .. }) => reason,
            Ok(_) => panic!("expected denial"),
        }
    }

    #[test]
    fn test_concurrency_cap_enforced() {
        let (governor, _) = governor(PlatformLimits {
            rate_per_sec: 1000.0,
            burst: 100,
            max_concurrency: 2,
        });

        let a = governor.try_admit("stubhub").unwrap();
        let _b = governor.try_admit("stubhub").unwrap();
        assert_eq!(
            denied(governor.try_admit("stubhub")),
            DenyReason::ConcurrencyLimit
        );
        assert_eq!(governor.snapshot("stubhub").in_flight, 2);

        governor.release(a, ReleaseOutcome::Success);
        assert_eq!(governor.snapshot("stubhub").in_flight, 1);
        assert!(governor.try_admit("stubhub").is_ok());
    }

    #[test]
    fn test_token_bucket_denies_after_burst() {
        let (governor, _) = governor(PlatformLimits {
            rate_per_sec: 0.01,
            burst: 2,
            max_concurrency: 10,
        });

        let _a = governor.try_admit("viagogo").unwrap();
        let _b = governor.try_admit("viagogo").unwrap();
        assert_eq!(denied(governor.try_admit("viagogo")), DenyReason::NoTokens);
        assert_eq!(governor.snapshot("viagogo").tokens_available, 0);
    }

    #[test]
    fn test_platforms_are_independent() {
        let (governor, _) = governor(PlatformLimits {
            rate_per_sec: 1000.0,
            burst: 10,
            max_concurrency: 1,
        });
        let _a = governor.try_admit("stubhub").unwrap();
        assert!(governor.try_admit("viagogo").is_ok());
    }

    #[test]
    fn test_rejection_halves_rate_with_floor() {
        let (governor, _) = governor(PlatformLimits {
            rate_per_sec: 0.4,
            burst: 10,
            max_concurrency: 10,
        });

        let token = governor.try_admit("stubhub").unwrap();
        governor.release(token, ReleaseOutcome::Rejected);
        assert!((governor.snapshot("stubhub").refill_rate - 0.2).abs() < 1e-9);

        for _ in 0..5 {
            let token = governor.try_admit("stubhub").unwrap();
            governor.release(token, ReleaseOutcome::Rejected);
        }
        assert!((governor.snapshot("stubhub").refill_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_after_success_window() {
        let clock = ManualClock::starting_now();
        let config = AdmissionConfig {
            default: PlatformLimits {
                rate_per_sec: 1000.0,
                burst: 1000,
                max_concurrency: 10,
            },
            recovery_window: 3,
            recovery_step: 100.0,
            ..Default::default()
        };
        let governor = AdmissionGovernor::new(config, Arc::new(clock));

        let token = governor.try_admit("stubhub").unwrap();
        governor.release(token, ReleaseOutcome::Rejected);
        assert_eq!(governor.snapshot("stubhub").refill_rate, 500.0);

        for _ in 0..3 {
            let token = governor.try_admit("stubhub").unwrap();
            governor.release(token, ReleaseOutcome::Success);
        }
        assert_eq!(governor.snapshot("stubhub").refill_rate, 600.0);
    }

    #[test]
    fn test_open_circuit_denies_until_probe_interval() {
        let (governor, clock) = governor(PlatformLimits {
            rate_per_sec: 1000.0,
            burst: 100,
            max_concurrency: 10,
        });

        governor.open_circuit("stubhub");
        assert_eq!(denied(governor.try_admit("stubhub")), DenyReason::CircuitOpen);

        clock.advance(ChronoDuration::seconds(31));
        let probe = governor.try_admit("stubhub").unwrap();
        assert!(probe.is_probe());
        assert_eq!(denied(governor.try_admit("stubhub")), DenyReason::CircuitOpen);

        governor.close_circuit("stubhub");
        let normal = governor.try_admit("stubhub").unwrap();
        assert!(!normal.is_probe());
    }

    #[test]
    fn test_disabled_platform_denied() {
        let (governor, _) = governor(PlatformLimits::default());
        governor.set_enabled("stubhub", false);
        assert_eq!(
            denied(governor.try_admit("stubhub")),
            DenyReason::PlatformDisabled
        );
        governor.set_enabled("stubhub", true);
        assert!(governor.try_admit("stubhub").is_ok());
    }

    #[test]
    fn test_per_platform_override() {
        let mut config = AdmissionConfig::default();
        config.platforms.insert(
            "ticketmaster".to_string(),
            PlatformLimits {
                rate_per_sec: 1.0,
                burst: 1,
                max_concurrency: 1,
            },
        );
        let governor = AdmissionGovernor::new(config, Arc::new(ManualClock::starting_now()));
        assert_eq!(governor.snapshot("ticketmaster").max_concurrency, 1);
        assert_eq!(governor.snapshot("stubhub").max_concurrency, 4);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = AdmissionConfig::default();
        config.default.max_concurrency = 0;
        assert!(config.validate().is_err());
        assert!(AdmissionConfig::default().validate().is_ok());
    }
}
