//! Engine composition root
//!
//! [`Engine`] wires the identity pool, governor, scheduler, cache, health
//! monitor and watchlist together and exposes the administrative
//! operations. Components are explicit instances built from
//! [`EngineConfig`]; nothing is a global.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticketwatch::config::EngineConfig;
//! use ticketwatch::engine::EngineBuilder;
//!
//! # async fn run() -> ticketwatch::Result<()> {
//! let engine = Arc::new(EngineBuilder::new(EngineConfig::default()).build()?);
//! engine.provision().await?;
//! engine.start_monitoring().await;
//! // ...
//! engine.stop_monitoring().await;
//! # Ok(())
//! # }
//! ```

pub mod dashboard;

pub use dashboard::{DashboardStats, PlatformDashboard};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::admission::AdmissionGovernor;
use crate::cache::{CacheWarmer, InvalidationReport, InvalidationTarget, ResultCache, WarmupReport};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::health::{HealthEvent, HealthMonitor, HealthReport};
use crate::identity::{
    IdentityPool, IdentityProvider, ProxyHealth, RotationSelector, StaticIdentityProvider,
};
use crate::metrics;
use crate::plugin::{
    PluginRegistry, PluginStatus, PluginTestReport, ScrapeResult, ScraperPlugin, PROBE_OPERATION,
};
use crate::scheduler::worker::release_outcome;
use crate::scheduler::{
    CancelOutcome, DispatchContext, EnqueueOutcome, JobRecord, JobRequest, ScrapeJob, Scheduler,
    WorkerPool,
};
use crate::storage::{EngineSnapshot, SnapshotStore};
use crate::utils::error::{PluginError, ScrapeErrorKind};
use crate::watchlist::{
    AlertCriteria, AlertEvent, BroadcastSink, LogSink, WatchItem, WatchRequest, Watchlist,
};

/// Alerts buffered per broadcast subscriber
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Alerts shown on the dashboard
const DASHBOARD_ALERTS: usize = 20;

/// Jobs shown on the dashboard
const DASHBOARD_JOBS: usize = 20;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<SharedClock>,
    plugins: PluginRegistry,
    provider: Option<Arc<dyn IdentityProvider>>,
    warmers: Vec<(String, Arc<dyn CacheWarmer>)>,
}

impl EngineBuilder {
    /// Start from a configuration
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            plugins: PluginRegistry::new(),
            provider: None,
            warmers: Vec::new(),
        }
    }

    /// Use a specific clock (defaults to the system clock)
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a scraper plugin
    pub fn with_plugin(mut self, plugin: Arc<dyn ScraperPlugin>) -> Self {
        self.plugins.register(plugin);
        self
    }

    /// Use a specific identity provider (defaults to the configured static list)
    pub fn with_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a cache warmer for a layer
    pub fn with_warmer(mut self, layer: impl Into<String>, warmer: Arc<dyn CacheWarmer>) -> Self {
        self.warmers.push((layer.into(), warmer));
        self
    }

    /// Validate the configuration and build the engine
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| Error::config(format!("{e:#}")))?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);

        let pool = Arc::new(IdentityPool::new(config.pool.clone(), clock.clone()));
        let selector = Arc::new(RotationSelector::new(
            Arc::clone(&pool),
            config.rotation.clone(),
        ));
        let governor = Arc::new(AdmissionGovernor::new(
            config.admission.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), clock.clone()));

        let cache = Arc::new(ResultCache::new(&config.cache, clock.clone()));
        for (layer, warmer) in self.warmers {
            cache.register_warmer(&layer, warmer)?;
        }

        let health = Arc::new(
            HealthMonitor::new(config.health.clone(), clock.clone())
                .with_governor(Arc::clone(&governor)),
        );

        let alerts = BroadcastSink::new(ALERT_CHANNEL_CAPACITY);
        let watchlist = Arc::new(Watchlist::new(config.watchlist.clone(), clock.clone()));
        watchlist.add_sink(Arc::new(alerts.clone()));
        watchlist.add_sink(Arc::new(LogSink));

        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(StaticIdentityProvider::new(&config.provider)));
        let store = config.storage.snapshot_path.clone().map(SnapshotStore::new);
        let (interval_tx, _) = watch::channel(config.scheduler.monitoring_interval_secs);

        tracing::info!(
            plugins = self.plugins.len(),
            provider = provider.name(),
            persistence = store.is_some(),
            "Engine built"
        );

        Ok(Engine {
            pool,
            selector,
            governor,
            scheduler,
            cache,
            health,
            watchlist,
            plugins: Arc::new(self.plugins),
            provider,
            alerts,
            store,
            monitoring: Mutex::new(None),
            interval_tx,
            started_at: Instant::now(),
            clock,
            config,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Background tasks owned while monitoring is on
struct MonitoringHandle {
    workers: WorkerPool,
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
}

/// What a snapshot restore brought back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub identities: usize,
    pub watch_items: usize,
    pub saved_at: DateTime<Utc>,
}

/// Scraping orchestration engine
pub struct Engine {
    config: EngineConfig,
    clock: SharedClock,
    pool: Arc<IdentityPool>,
    selector: Arc<RotationSelector>,
    governor: Arc<AdmissionGovernor>,
    scheduler: Arc<Scheduler>,
    cache: Arc<ResultCache>,
    health: Arc<HealthMonitor>,
    watchlist: Arc<Watchlist>,
    plugins: Arc<PluginRegistry>,
    provider: Arc<dyn IdentityProvider>,
    alerts: BroadcastSink,
    store: Option<SnapshotStore>,
    monitoring: Mutex<Option<MonitoringHandle>>,
    interval_tx: watch::Sender<u64>,
    started_at: Instant,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("platforms", &self.platforms())
            .field("identities", &self.pool.len())
            .field("watch_items", &self.watchlist.len())
            .finish()
    }
}

impl Engine {
    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Clock shared by every component
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.pool
    }

    pub fn governor(&self) -> &Arc<AdmissionGovernor> {
        &self.governor
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn watchlist(&self) -> &Arc<Watchlist> {
        &self.watchlist
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Components a worker loop needs
    pub fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            scheduler: Arc::clone(&self.scheduler),
            governor: Arc::clone(&self.governor),
            selector: Arc::clone(&self.selector),
            plugins: Arc::clone(&self.plugins),
            cache: Arc::clone(&self.cache),
            watchlist: Arc::clone(&self.watchlist),
            health: Arc::clone(&self.health),
        }
    }

    /// Configured platforms plus every platform with a plugin
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: BTreeSet<String> =
            self.config.scheduler.platforms.iter().cloned().collect();
        platforms.extend(self.plugins.platforms());
        platforms.into_iter().collect()
    }

    /// Time since the engine was built
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    /// Load identities for every platform from the provider
    ///
    /// Returns the number of identities added to the pool.
    pub async fn provision(&self) -> Result<usize> {
        let mut added = 0;
        for platform in self.platforms() {
            let identities = self.provider.list_identities(&platform).await?;
            let count = self.pool.expand(identities);
            tracing::debug!(platform = %platform, added = count, "Identities provisioned");
            added += count;
        }

        let stats = self.pool.stats();
        metrics::update_identity_counts(stats.active, stats.cooling, stats.disabled);
        tracing::info!(added, total = stats.total, "Identity pool provisioned");
        Ok(added)
    }

    /// Reload identity state and watch items from the last snapshot
    pub async fn restore(&self) -> Result<Option<RestoreReport>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(snapshot) = store.load()? else {
            tracing::info!(path = %store.path().display(), "No snapshot to restore");
            return Ok(None);
        };

        let identities = self.pool.restore(snapshot.identities);
        let watch_items = self.watchlist.restore(snapshot.watch_items).await;
        tracing::info!(
            identities,
            watch_items,
            saved_at = %snapshot.saved_at,
            "Engine state restored"
        );
        Ok(Some(RestoreReport {
            identities,
            watch_items,
            saved_at: snapshot.saved_at,
        }))
    }

    /// Write identity state and watch items to the snapshot file
    ///
    /// Returns false when persistence is disabled.
    pub async fn save_snapshot(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let snapshot = EngineSnapshot::new(self.pool.all(), self.watchlist.export().await);
        store.save(&snapshot)?;
        tracing::debug!(
            path = %store.path().display(),
            identities = snapshot.identities.len(),
            watch_items = snapshot.watch_items.len(),
            "Snapshot saved"
        );
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Monitoring lifecycle
    // ------------------------------------------------------------------------

    /// Start worker loops and background tasks
    ///
    /// Returns false when monitoring was already running.
    pub async fn start_monitoring(self: &Arc<Self>) -> bool {
        let mut guard = self.monitoring.lock().await;
        if guard.is_some() {
            return false;
        }

        let platforms = self.platforms();
        let workers = WorkerPool::spawn(self.dispatch_context(), &platforms);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tasks.spawn(refresh_loop(Arc::clone(self), shutdown_rx.clone()));
        tasks.spawn(housekeeping_loop(Arc::clone(self), shutdown_rx.clone()));
        if self.store.is_some() {
            tasks.spawn(snapshot_loop(Arc::clone(self), shutdown_rx));
        }

        *guard = Some(MonitoringHandle {
            workers,
            tasks,
            shutdown,
        });
        tracing::info!(
            platforms = ?platforms,
            interval_secs = self.monitoring_interval(),
            "Monitoring started"
        );
        true
    }

    /// Stop worker loops and background tasks, then save a snapshot
    ///
    /// Returns false when monitoring was not running.
    pub async fn stop_monitoring(&self) -> bool {
        let handle = self.monitoring.lock().await.take();
        let Some(handle) = handle else {
            return false;
        };

        let _ = handle.shutdown.send(true);
        handle.workers.shutdown().await;
        let mut tasks = handle.tasks;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Background task panicked");
            }
        }

        if let Err(e) = self.save_snapshot().await {
            tracing::warn!(error = %e, "Snapshot on shutdown failed");
        }
        tracing::info!("Monitoring stopped");
        true
    }

    /// Whether worker loops are running
    pub async fn is_monitoring(&self) -> bool {
        self.monitoring.lock().await.is_some()
    }

    /// Change the watch refresh interval; takes effect immediately
    pub fn set_monitoring_interval(&self, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(Error::config("monitoring interval must be greater than 0"));
        }
        self.interval_tx.send_replace(seconds);
        tracing::info!(interval_secs = seconds, "Monitoring interval updated");
        Ok(())
    }

    /// Current watch refresh interval in seconds
    pub fn monitoring_interval(&self) -> u64 {
        *self.interval_tx.borrow()
    }

    /// Replace the default alert criteria
    pub fn set_alert_thresholds(&self, criteria: AlertCriteria) -> Result<()> {
        self.watchlist.set_default_criteria(criteria)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Queue a scrape job
    ///
    /// The recent-trigger bonus is filled in from the watchlist when the
    /// request does not carry one.
    pub fn enqueue(&self, mut request: JobRequest) -> Result<EnqueueOutcome> {
        if request.last_triggered_at.is_none() {
            request.last_triggered_at = self
                .watchlist
                .last_triggered(&request.platform, &request.target);
        }
        Ok(self.scheduler.enqueue(request)?)
    }

    /// Cancel a queued or running job
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        Ok(self.scheduler.cancel(job_id)?)
    }

    /// Live job state
    pub fn job(&self, job_id: &str) -> Option<ScrapeJob> {
        self.scheduler.job(job_id)
    }

    /// Jobs waiting in a platform's queue, best first
    pub fn queued_jobs(&self, platform: &str) -> Vec<ScrapeJob> {
        self.scheduler.queued_jobs(platform)
    }

    /// Recently finished jobs, newest first
    pub fn recent_jobs(&self, limit: usize) -> Vec<JobRecord> {
        self.scheduler.recent_jobs(limit)
    }

    /// Queue a refresh job for every watched entity
    ///
    /// Returns the number of newly queued jobs; entities already queued
    /// are coalesced.
    pub async fn refresh_watchlist(&self) -> usize {
        let mut queued = 0;
        for target in self.watchlist.refresh_targets().await {
            let mut request = JobRequest::new(&target.platform, &target.operation, &target.entity)
                .with_last_triggered(target.last_triggered_at);
            if let Some(date) = target.event_date {
                request = request.with_event_date(date);
            }
            if target.high_demand {
                request = request.high_demand();
            }

            match self.scheduler.enqueue(request) {
                Ok(outcome) if !outcome.coalesced => queued += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    platform = %target.platform,
                    entity = %target.entity,
                    error = %e,
                    "Refresh job not queued"
                ),
            }
        }
        queued
    }

    // ------------------------------------------------------------------------
    // Watchlist
    // ------------------------------------------------------------------------

    /// Watch an entity and queue an immediate refresh for it
    pub async fn add_to_watchlist(&self, request: WatchRequest) -> Result<WatchItem> {
        let item = self.watchlist.add(request).await?;

        let mut job = JobRequest::new(&item.platform, &item.operation, &item.entity)
            .with_last_triggered(item.last_triggered_at);
        if let Some(date) = item.event_date {
            job = job.with_event_date(date);
        }
        if item.high_demand {
            job = job.high_demand();
        }
        if let Err(e) = self.scheduler.enqueue(job) {
            tracing::warn!(item_id = %item.id, error = %e, "Initial refresh not queued");
        }
        Ok(item)
    }

    /// Stop watching an entity for every owner
    ///
    /// Returns the number of removed watch items.
    pub async fn remove_from_watchlist(&self, platform: &str, entity: &str) -> Result<usize> {
        Ok(self.watchlist.remove_entity(platform, entity).await?)
    }

    /// Remove one watch item by id
    pub async fn remove_watch_item(&self, id: &str) -> Result<WatchItem> {
        Ok(self.watchlist.remove(id).await?)
    }

    /// Every watch item
    pub async fn watch_items(&self) -> Vec<WatchItem> {
        self.watchlist.list().await
    }

    /// Recent alerts, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        self.watchlist.recent_alerts(limit)
    }

    /// Receive alerts as they are emitted
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    /// Receive health status changes
    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    // ------------------------------------------------------------------------
    // Plugins and identities
    // ------------------------------------------------------------------------

    /// Run one probe operation through a platform's plugin
    ///
    /// Bypasses the governor and does not feed the health monitor.
    pub async fn test_plugin(&self, platform: &str) -> Result<PluginTestReport> {
        let plugin = match self.plugins.get(platform) {
            Ok(plugin) => plugin,
            Err(PluginError::Disabled(_)) => {
                return Ok(PluginTestReport {
                    platform: platform.to_string(),
                    status: "disabled".to_string(),
                    latency_ms: None,
                    error: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let lease = match self.selector.select(platform, PROBE_OPERATION) {
            Ok(lease) => lease,
            Err(e) => {
                return Ok(PluginTestReport {
                    platform: platform.to_string(),
                    status: "no_identity".to_string(),
                    latency_ms: None,
                    error: Some(e.to_string()),
                });
            }
        };

        let timeout = self.config.operation_timeout();
        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            plugin.execute(PROBE_OPERATION, plugin.probe_target(), &lease),
        )
        .await
        .unwrap_or_else(|_| ScrapeResult::failed(ScrapeErrorKind::Timeout, timeout));
        let elapsed = started.elapsed();

        if let Err(e) = self.pool.release(lease.id(), release_outcome(&result)) {
            tracing::warn!(identity = %lease.id(), error = %e, "Identity release failed");
        }

        let latency = if result.latency.is_zero() {
            elapsed
        } else {
            result.latency
        };
        let report = PluginTestReport {
            platform: platform.to_string(),
            status: if result.success { "ok" } else { "failed" }.to_string(),
            latency_ms: Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
            error: result.failure_kind().map(|kind| kind.to_string()),
        };
        tracing::info!(
            platform,
            status = %report.status,
            latency_ms = ?report.latency_ms,
            "Plugin self-test finished"
        );
        Ok(report)
    }

    /// Allow dispatch for a platform
    pub fn enable_plugin(&self, platform: &str) -> Result<()> {
        self.plugins.set_enabled(platform, true)?;
        self.governor.set_enabled(platform, true);
        tracing::info!(platform, "Plugin enabled");
        Ok(())
    }

    /// Stop dispatch for a platform; queued jobs stay queued
    pub fn disable_plugin(&self, platform: &str) -> Result<()> {
        self.plugins.set_enabled(platform, false)?;
        self.governor.set_enabled(platform, false);
        tracing::info!(platform, "Plugin disabled");
        Ok(())
    }

    /// Registered plugins with their enabled flag
    pub fn plugin_statuses(&self) -> std::collections::BTreeMap<String, PluginStatus> {
        self.plugins.statuses()
    }

    /// Probe every identity's proxy concurrently
    pub async fn test_all_proxies(&self) -> Vec<ProxyHealth> {
        let identities = self.pool.all();
        let results = join_all(
            identities
                .iter()
                .map(|identity| self.provider.test_proxy(identity)),
        )
        .await;

        let unhealthy = results.iter().filter(|r| !r.healthy).count();
        if unhealthy > 0 {
            tracing::warn!(unhealthy, total = results.len(), "Unhealthy proxies found");
        } else {
            tracing::info!(total = results.len(), "All proxies healthy");
        }
        results
    }

    // ------------------------------------------------------------------------
    // Cache and health
    // ------------------------------------------------------------------------

    /// Invalidate cache entries
    pub fn clear_cache(&self, target: &InvalidationTarget, cascade: bool) -> InvalidationReport {
        let report = self.cache.invalidate(target, cascade);
        tracing::info!(
            target = ?target,
            cascade,
            removed = report.values().sum::<usize>(),
            "Cache cleared"
        );
        report
    }

    /// Run registered warmers for the given layers (all layers when empty)
    pub async fn warmup_cache(&self, layers: &[String]) -> Result<WarmupReport> {
        Ok(self.cache.warmup(layers).await?)
    }

    /// Health of every known platform
    pub fn health_status(&self) -> HealthReport {
        self.health.report(&self.platforms())
    }

    /// Periodic maintenance
    ///
    /// Re-admits idle identities, purges expired cache entries and
    /// refreshes gauges.
    pub fn housekeeping(&self) {
        let readmitted = self.pool.reconcile();
        let purged = self.cache.purge_expired();

        let stats = self.pool.stats();
        metrics::update_identity_counts(stats.active, stats.cooling, stats.disabled);
        for budget in self.governor.snapshots() {
            metrics::update_budget(&budget.platform, budget.in_flight, budget.refill_rate);
        }
        for (platform, queue) in self.scheduler.snapshots() {
            metrics::set_queue_depth(&platform, queue.depth);
        }

        if readmitted > 0 || purged > 0 {
            tracing::debug!(readmitted, purged, "Housekeeping pass");
        }
    }

    // ------------------------------------------------------------------------
    // Dashboard
    // ------------------------------------------------------------------------

    /// Aggregated statistics for the dashboard
    pub async fn dashboard_stats(&self) -> DashboardStats {
        let queues = self.scheduler.snapshots();
        let report = self.health_status();

        let mut platforms = std::collections::BTreeMap::new();
        for platform in self.platforms().into_iter().chain(queues.keys().cloned()) {
            if platforms.contains_key(&platform) {
                continue;
            }
            let budget = self.governor.snapshot(&platform);
            let health = report
                .platforms
                .get(&platform)
                .cloned()
                .unwrap_or_else(|| self.health.platform_health(&platform));
            let queue = queues.get(&platform);

            platforms.insert(
                platform.clone(),
                PlatformDashboard {
                    plugin_enabled: self.plugins.is_enabled(&platform),
                    health: health.status,
                    circuit: budget.circuit,
                    queue_depth: queue.map_or(0, |q| q.depth),
                    in_flight: budget.in_flight,
                    max_concurrency: budget.max_concurrency,
                    refill_rate: budget.refill_rate,
                    success_rate: health.success_rate,
                    avg_latency_ms: health.avg_latency_ms,
                    samples: health.samples,
                    jobs: queue.map(|q| q.counters).unwrap_or_default(),
                    platform,
                },
            );
        }

        let (success_rate, avg_latency_ms) = dashboard::weighted_totals(platforms.values());
        let identities = self.pool.stats();

        DashboardStats {
            generated_at: self.clock.now(),
            uptime_secs: self.uptime().as_secs(),
            monitoring: self.is_monitoring().await,
            monitoring_interval_secs: self.monitoring_interval(),
            health: report.status,
            success_rate,
            avg_latency_ms,
            queue_depth: platforms.values().map(|p| p.queue_depth).sum(),
            active_identities: identities.active,
            identities,
            platforms,
            cache: self.cache.stats(),
            watchlist: self.watchlist.stats().await,
            recent_alerts: self.recent_alerts(DASHBOARD_ALERTS),
            recent_jobs: self.recent_jobs(DASHBOARD_JOBS),
        }
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Queue watch refreshes every monitoring interval
async fn refresh_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut interval_rx = engine.interval_tx.subscribe();

    loop {
        let queued = engine.refresh_watchlist().await;
        if queued > 0 {
            tracing::debug!(queued, "Watch refresh jobs queued");
        }

        let secs = *interval_rx.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn housekeeping_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(engine.config.storage.housekeeping_interval_secs);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => engine.housekeeping(),
            _ = shutdown.changed() => break,
        }
    }
}

async fn snapshot_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(engine.config.storage.snapshot_interval_secs);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately; nothing worth saving yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.save_snapshot().await {
                    tracing::warn!(error = %e, "Periodic snapshot failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
