//! Worker loops
//!
//! Each platform gets `workers_per_platform` independent loops. One loop
//! iteration ([`dispatch_once`]) walks a job through the whole pipeline:
//!
//! ```text
//! admit ─► pop ─► select identity ─► execute (timeout) ─► release
//!                                                     │
//!                     health ◄──────────────────────┤
//!                     cache + watchlist (success) ◄─┤
//!                     retry / fail (failure) ◄──────┘
//! ```
//!
//! Admission is asked before a job leaves the queue, so a saturated
//! platform never reorders its queue. An exhausted identity pool returns
//! the popped job untouched, still ready and in its original position.
//! Both are backpressure and never consume an attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::{FailureDisposition, ScrapeJob, Scheduler};
use crate::admission::AdmissionGovernor;
use crate::cache::{CacheKey, ResultCache};
use crate::health::{HealthMonitor, SampleOutcome};
use crate::identity::{ReleaseOutcome, RotationSelector};
use crate::metrics;
use crate::plugin::{PluginRegistry, ScrapeResult};
use crate::utils::error::{PluginError, PoolError, ScrapeErrorKind};
use crate::watchlist::Watchlist;

/// Cache layer holding listing results
pub const RESULT_LAYER: &str = "tickets";

/// Components a worker needs to run a job
#[derive(Clone)]
pub struct DispatchContext {
    pub scheduler: Arc<Scheduler>,
    pub governor: Arc<AdmissionGovernor>,
    pub selector: Arc<RotationSelector>,
    pub plugins: Arc<PluginRegistry>,
    pub cache: Arc<ResultCache>,
    pub watchlist: Arc<Watchlist>,
    pub health: Arc<HealthMonitor>,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("platforms", &self.plugins.platforms())
            .finish()
    }
}

/// What one dispatch step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing ready
    Idle,
    /// Ready work left in place because the platform has no capacity
    Throttled { reason: String },
    /// Job returned to the queue without using an attempt
    Deferred { job_id: String, reason: String },
    Completed { job_id: String, alerts: usize },
    Retrying { job_id: String, attempt: u32 },
    Failed { job_id: String, error: String },
    Cancelled { job_id: String },
}

/// Outcome reported to the identity pool and the governor
///
/// A permanent failure means the target is gone, not that the identity or
/// the platform misbehaved.
pub(crate) fn release_outcome(result: &ScrapeResult) -> ReleaseOutcome {
    match result.failure_kind() {
        None | Some(ScrapeErrorKind::PermanentFailure { .. }) => ReleaseOutcome::Success,
        Some(kind) if kind.escalates_backoff() => ReleaseOutcome::Rejected,
        Some(_) => ReleaseOutcome::Failure,
    }
}

fn sample_outcome(result: &ScrapeResult) -> SampleOutcome {
    match result.failure_kind() {
        None => SampleOutcome::Success,
        Some(kind) if kind.escalates_backoff() => SampleOutcome::Rejected,
        Some(_) => SampleOutcome::Failure,
    }
}

impl DispatchContext {
    fn backpressure(&self) -> Duration {
        Duration::from_millis(self.scheduler.config().backpressure_delay_ms)
    }

    fn throttled(&self, platform: &str, reason: String) -> DispatchOutcome {
        tracing::debug!(platform = %platform, reason = %reason, "Dispatch throttled");
        DispatchOutcome::Throttled { reason }
    }

    fn defer(&self, job: &ScrapeJob, reason: String) -> DispatchOutcome {
        tracing::debug!(
            job_id = %job.id,
            platform = %job.platform,
            reason = %reason,
            "Job deferred"
        );
        self.scheduler.defer(job);
        DispatchOutcome::Deferred {
            job_id: job.id.clone(),
            reason,
        }
    }

    /// Run the best ready job of a platform through the pipeline
    pub async fn dispatch_once(&self, platform: &str) -> DispatchOutcome {
        if !self.scheduler.has_ready(platform) {
            return DispatchOutcome::Idle;
        }

        let plugin = match self.plugins.get(platform) {
            Ok(plugin) => Some(plugin),
            Err(e @ PluginError::Disabled(_)) => return self.throttled(platform, e.to_string()),
            Err(PluginError::NotRegistered(_)) => None,
        };
        let token = match self.governor.try_admit(platform) {
            Ok(token) => token,
            Err(e) => return self.throttled(platform, e.to_string()),
        };

        // Another worker may have taken the last ready job meanwhile
        let Some(job) = self.scheduler.pop_ready(platform) else {
            return DispatchOutcome::Idle;
        };
        if job.is_cancelled() {
            drop(token);
            self.scheduler.acknowledge_cancel(&job);
            return DispatchOutcome::Cancelled { job_id: job.id };
        }
        let Some(plugin) = plugin else {
            drop(token);
            let error = PluginError::NotRegistered(platform.to_string()).to_string();
            return self.fail(&job, &error, false);
        };

        let lease = match self.selector.select(platform, &job.operation) {
            Ok(lease) => lease,
            Err(e @ PoolError::Exhausted { .. }) => {
                drop(token);
                self.health.record_exhausted(platform);
                return self.defer(&job, e.to_string());
            }
            Err(e) => {
                drop(token);
                tracing::error!(job_id = %job.id, error = %e, "Identity selection failed");
                return self.defer(&job, e.to_string());
            }
        };

        let timeout = Duration::from_secs(self.scheduler.config().operation_timeout_secs);
        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            plugin.execute(&job.operation, &job.target, &lease),
        )
        .await
        .unwrap_or_else(|_| ScrapeResult::failed(ScrapeErrorKind::Timeout, timeout));
        let elapsed = started.elapsed();
        let latency = if result.latency.is_zero() {
            elapsed
        } else {
            result.latency
        };

        let outcome = release_outcome(&result);
        if let Err(e) = self.selector.pool().release(lease.id(), outcome) {
            tracing::warn!(identity = %lease.id(), error = %e, "Identity release failed");
        }
        self.governor.release(token, outcome);
        // A slot is free again; wake a worker waiting out backpressure
        self.scheduler.notifier(platform).notify_one();
        self.health.record(platform, sample_outcome(&result), latency);
        metrics::observe_job_duration(platform, elapsed.as_secs_f64());

        match result.failure_kind() {
            None => self.commit(&job, result).await,
            Some(kind) => self.fail(&job, &kind.to_string(), kind.is_retryable()),
        }
    }

    /// Store a successful result unless the job was cancelled meanwhile
    async fn commit(&self, job: &ScrapeJob, result: ScrapeResult) -> DispatchOutcome {
        if job.is_cancelled() {
            self.scheduler.acknowledge_cancel(job);
            tracing::info!(job_id = %job.id, "Cancelled job finished, result discarded");
            return DispatchOutcome::Cancelled {
                job_id: job.id.clone(),
            };
        }

        // Cache and watchlist failures never fail the job
        let key = CacheKey::new(&job.platform, &job.target, RESULT_LAYER);
        let tags = [
            format!("event:{}", job.target),
            format!("platform:{}", job.platform),
        ];
        if let Err(e) = self.cache.put(&key, result.payload.clone(), None, tags) {
            tracing::warn!(job_id = %job.id, key = %key, error = %e, "Result not cached");
        }

        let alerts = match self
            .watchlist
            .process_result(&job.platform, &job.target, &result.payload)
            .await
        {
            Ok(alerts) => alerts.len(),
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    target = %job.target,
                    error = %e,
                    "Watchlist comparison skipped"
                );
                0
            }
        };

        self.scheduler.complete(job);
        tracing::debug!(job_id = %job.id, platform = %job.platform, alerts, "Job completed");
        DispatchOutcome::Completed {
            job_id: job.id.clone(),
            alerts,
        }
    }

    fn fail(&self, job: &ScrapeJob, error: &str, retryable: bool) -> DispatchOutcome {
        match self.scheduler.fail(job, error, retryable) {
            FailureDisposition::Retrying { attempt, .. } => DispatchOutcome::Retrying {
                job_id: job.id.clone(),
                attempt,
            },
            FailureDisposition::Failed if job.is_cancelled() => DispatchOutcome::Cancelled {
                job_id: job.id.clone(),
            },
            FailureDisposition::Failed => {
                self.health.record_job_failure(&job.platform, &job.id, error);
                DispatchOutcome::Failed {
                    job_id: job.id.clone(),
                    error: error.to_string(),
                }
            }
        }
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Running worker loops for every platform
#[derive(Debug)]
pub struct WorkerPool {
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    platforms: Vec<String>,
}

impl WorkerPool {
    /// Spawn `workers_per_platform` loops for each platform
    pub fn spawn(context: DispatchContext, platforms: &[String]) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let workers = context.scheduler.config().workers_per_platform;

        for platform in platforms {
            for worker_id in 0..workers {
                let context = context.clone();
                let platform = platform.clone();
                let shutdown_rx = shutdown_rx.clone();
                tasks.spawn(async move {
                    worker_loop(context, platform, worker_id, shutdown_rx).await;
                });
            }
        }

        tracing::info!(
            platforms = platforms.len(),
            workers_per_platform = workers,
            "Worker pool started"
        );
        Self {
            tasks,
            shutdown,
            platforms: platforms.to_vec(),
        }
    }

    /// Platforms served by this pool
    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Number of live worker tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every worker has exited
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every worker and wait for them to exit
    ///
    /// In-flight external calls are allowed to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    context: DispatchContext,
    platform: String,
    worker_id: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let notify = context.scheduler.notifier(&platform);
    let idle_max = Duration::from_millis(context.scheduler.config().idle_poll_ms);
    tracing::debug!(platform = %platform, worker_id, "Worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait = match context.dispatch_once(&platform).await {
            DispatchOutcome::Idle => context.scheduler.idle_wait(&platform, idle_max),
            DispatchOutcome::Throttled { .. } | DispatchOutcome::Deferred { .. } => {
                context.backpressure().min(idle_max)
            }
            _ => continue,
        };
        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    tracing::debug!(platform = %platform, worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, PlatformLimits};
    use crate::cache::CacheConfig;
    use crate::clock::{Clock, ManualClock};
    use crate::health::HealthConfig;
    use crate::identity::{Identity, IdentityLease, IdentityPool, PoolConfig, RotationConfig};
    use crate::plugin::ScraperPlugin;
    use crate::scheduler::{JobRequest, JobState, Priority, SchedulerConfig};
    use crate::watchlist::{WatchRequest, WatchlistConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedPlugin {
        results: Mutex<Vec<ScrapeResult>>,
    }

    impl ScriptedPlugin {
        fn new(mut results: Vec<ScrapeResult>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl ScraperPlugin for ScriptedPlugin {
        fn platform(&self) -> &str {
            "stubhub"
        }

        async fn execute(
            &self,
            _op: &str,
            _target: &str,
            _identity: &IdentityLease,
        ) -> ScrapeResult {
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| {
                    ScrapeResult::ok(serde_json::json!({}), Duration::from_millis(1))
                })
        }
    }

    fn context(
        clock: &ManualClock,
        plugin: ScriptedPlugin,
        identities: usize,
    ) -> DispatchContext {
        let shared: crate::clock::SharedClock = Arc::new(clock.clone());
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            Arc::clone(&shared),
        ));
        let admission = AdmissionConfig {
            default: PlatformLimits {
                rate_per_sec: 1000.0,
                burst: 1000,
                max_concurrency: 4,
            },
            ..Default::default()
        };
        let governor = Arc::new(AdmissionGovernor::new(admission, Arc::clone(&shared)));
        let pool = Arc::new(IdentityPool::new(PoolConfig::default(), Arc::clone(&shared)));
        pool.expand((0..identities).map(|i| Identity::new(format!("id-{i}"))));
        let selector = Arc::new(RotationSelector::new(
            pool,
            RotationConfig {
                min_spacing_secs: 0,
                seed: Some(7),
            },
        ));
        DispatchContext {
            scheduler,
            governor: Arc::clone(&governor),
            selector,
            plugins: Arc::new(PluginRegistry::new().with_plugin(Arc::new(plugin))),
            cache: Arc::new(ResultCache::new(
                &CacheConfig::default(),
                Arc::clone(&shared),
            )),
            watchlist: Arc::new(Watchlist::new(
                WatchlistConfig::default(),
                Arc::clone(&shared),
            )),
            health: Arc::new(
                HealthMonitor::new(HealthConfig::default(), shared).with_governor(governor),
            ),
        }
    }

    #[tokio::test]
    async fn test_success_caches_and_compares() {
        let clock = ManualClock::starting_now();
        let payload = serde_json::json!({ "available": true, "listing_count": 3 });
        let result = ScrapeResult::ok(payload.clone(), Duration::from_millis(20));
        let ctx = context(&clock, ScriptedPlugin::new(vec![result]), 2);
        let baseline = crate::watchlist::ListingSnapshot {
            min_price: None,
            available: false,
            listing_count: 0,
            observed_at: clock.now(),
        };
        ctx.watchlist
            .add(WatchRequest::new("stubhub", "evt-1").with_baseline(baseline))
            .await
            .unwrap();
        ctx.scheduler
            .enqueue(JobRequest::new("stubhub", "event_listings", "evt-1"))
            .unwrap();

        let outcome = ctx.dispatch_once("stubhub").await;
        assert!(matches!(outcome, DispatchOutcome::Completed { alerts: 2, .. }));
        assert_eq!(
            ctx.cache.get(&CacheKey::new("stubhub", "evt-1", RESULT_LAYER)),
            Some(payload)
        );
        assert_eq!(ctx.dispatch_once("stubhub").await, DispatchOutcome::Idle);
    }

    #[tokio::test]
    async fn test_failure_retries_then_surfaces_to_health() {
        let clock = ManualClock::starting_now();
        let timeout = || ScrapeResult::failed(ScrapeErrorKind::Timeout, Duration::from_millis(5));
        let ctx = context(&clock, ScriptedPlugin::new(vec![timeout(), timeout()]), 2);
        let mut events = ctx.health.subscribe();
        ctx.scheduler
            .enqueue(JobRequest::new("stubhub", "search", "evt-1").with_max_attempts(2))
            .unwrap();

        assert!(matches!(
            ctx.dispatch_once("stubhub").await,
            DispatchOutcome::Retrying { attempt: 1, .. }
        ));
        clock.advance(chrono::Duration::seconds(5));
        assert!(matches!(
            ctx.dispatch_once("stubhub").await,
            DispatchOutcome::Failed { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            crate::health::HealthEvent::JobFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried_and_identity_spared() {
        let clock = ManualClock::starting_now();
        let ctx = context(
            &clock,
            ScriptedPlugin::new(vec![ScrapeResult::failed(
                ScrapeErrorKind::permanent("event removed"),
                Duration::from_millis(5),
            )]),
            1,
        );
        ctx.scheduler
            .enqueue(JobRequest::new("stubhub", "search", "evt-1"))
            .unwrap();

        assert!(matches!(
            ctx.dispatch_once("stubhub").await,
            DispatchOutcome::Failed { .. }
        ));
        let identity = ctx.selector.pool().get("id-0").unwrap();
        assert_eq!(identity.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_exhausted_pool_defers_without_attempt() {
        let clock = ManualClock::starting_now();
        let ctx = context(&clock, ScriptedPlugin::new(vec![]), 0);
        let job_id = ctx
            .scheduler
            .enqueue(JobRequest::new("stubhub", "search", "evt-1"))
            .unwrap()
            .job_id;

        let ready_at = ctx.scheduler.job(&job_id).unwrap().ready_at;

        assert!(matches!(
            ctx.dispatch_once("stubhub").await,
            DispatchOutcome::Deferred { .. }
        ));
        let job = ctx.scheduler.job(&job_id).unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.ready_at, ready_at);
        assert_eq!(ctx.governor.snapshot("stubhub").in_flight, 0);
    }

    #[tokio::test]
    async fn test_disabled_platform_throttles() {
        let clock = ManualClock::starting_now();
        let ctx = context(&clock, ScriptedPlugin::new(vec![]), 1);
        ctx.governor.set_enabled("stubhub", false);
        let job_id = ctx
            .scheduler
            .enqueue(JobRequest::new("stubhub", "search", "evt-1"))
            .unwrap()
            .job_id;

        assert!(matches!(
            ctx.dispatch_once("stubhub").await,
            DispatchOutcome::Throttled { .. }
        ));
        let job = ctx.scheduler.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_saturated_platform_keeps_queue_order() {
        let clock = ManualClock::starting_now();
        let ctx = context(&clock, ScriptedPlugin::new(vec![]), 2);
        let low = ctx
            .scheduler
            .enqueue(JobRequest::new("stubhub", "search", "low").with_priority(Priority::Low))
            .unwrap()
            .job_id;
        let high = ctx
            .scheduler
            .enqueue(JobRequest::new("stubhub", "search", "high").with_priority(Priority::High))
            .unwrap()
            .job_id;
        let high_ready_at = ctx.scheduler.job(&high).unwrap().ready_at;

        let mut held: Vec<_> = (0..4)
            .map(|_| ctx.governor.try_admit("stubhub").unwrap())
            .collect();
        for _ in 0..2 {
            assert!(matches!(
                ctx.dispatch_once("stubhub").await,
                DispatchOutcome::Throttled { .. }
            ));
        }
        let waiting = ctx.scheduler.job(&high).unwrap();
        assert_eq!(waiting.state, JobState::Queued);
        assert_eq!(waiting.ready_at, high_ready_at);

        let token = held.pop().unwrap();
        ctx.governor.release(token, ReleaseOutcome::Success);
        assert_eq!(
            ctx.dispatch_once("stubhub").await,
            DispatchOutcome::Completed {
                job_id: high,
                alerts: 0
            }
        );
        assert_eq!(ctx.scheduler.job(&low).unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_cancelled_in_flight_skips_commit() {
        let clock = ManualClock::starting_now();
        let ctx = context(&clock, ScriptedPlugin::new(vec![]), 1);
        let id = ctx
            .scheduler
            .enqueue(JobRequest::new("stubhub", "search", "evt-1"))
            .unwrap()
            .job_id;
        let job = ctx.scheduler.pop_ready("stubhub").unwrap();
        ctx.scheduler.cancel(&id).unwrap();

        let result = ScrapeResult::ok(serde_json::json!({}), Duration::ZERO);
        let outcome = ctx.commit(&job, result).await;
        assert_eq!(outcome, DispatchOutcome::Cancelled { job_id: id });
        assert!(ctx
            .cache
            .get(&CacheKey::new("stubhub", "evt-1", RESULT_LAYER))
            .is_none());
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue_and_stops() {
        let clock = ManualClock::starting_now();
        let ctx = context(&clock, ScriptedPlugin::new(vec![]), 3);
        for i in 0..5 {
            ctx.scheduler
                .enqueue(JobRequest::new("stubhub", "search", format!("evt-{i}")))
                .unwrap();
        }

        let pool = WorkerPool::spawn(ctx.clone(), &["stubhub".to_string()]);
        for _ in 0..200 {
            if ctx.scheduler.snapshots()["stubhub"].counters.completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.scheduler.snapshots()["stubhub"].counters.completed, 5);
        pool.shutdown().await;
    }
}
