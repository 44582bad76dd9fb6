//! Watchlist and alert engine
//!
//! Watch items pair a marketplace entity with alert criteria. Every fresh
//! scrape result for the entity is compared with the item's last-known
//! snapshot; qualifying changes become [`AlertEvent`]s handed to the
//! registered [`AlertSink`]s.
//!
//! # Architecture
//!
//! ```text
//!  scrape result ──► Watchlist::process_result
//!                        │  per-item lock: compare, update snapshot
//!                        ▼
//!                   AlertEvent ──► history
//!                        │
//!              ┌─────────┴─────────┐
//!              ▼                   ▼
//!        BroadcastSink          LogSink
//! ```
//!
//! Comparison and snapshot update happen under the item's own mutex, so two
//! results racing for the same entity can never both observe the old
//! snapshot. An identical repeated result therefore produces no second alert.

pub mod criteria;
pub mod sinks;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::metrics;
use crate::utils::error::WatchlistError;

pub use criteria::{AlertCriteria, AlertKind, AlertSeverity, ListingSnapshot};
pub use sinks::{AlertSink, BroadcastSink, LogSink, SinkError};

/// Operation used for watch refresh jobs when none is given
pub const DEFAULT_OPERATION: &str = "event_listings";

// ============================================================================
// Configuration
// ============================================================================

/// Watchlist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchlistConfig {
    /// Stop comparing an item after it triggers until it is resumed
    pub auto_pause_on_trigger: bool,

    /// Alerts kept in the history
    pub history_limit: usize,

    /// Criteria for items registered without their own
    pub default_criteria: AlertCriteria,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            auto_pause_on_trigger: false,
            history_limit: 500,
            default_criteria: AlertCriteria::default(),
        }
    }
}

impl WatchlistConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.history_limit == 0 {
            return Err("watchlist.history_limit must be positive".to_string());
        }
        self.default_criteria.validate().map_err(|e| e.to_string())
    }
}

// ============================================================================
// Watch Items
// ============================================================================

/// Lifecycle of a watch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    #[default]
    Active,
    Paused,
    Triggered,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Triggered => "triggered",
        }
    }
}

/// A monitored entity with its alert criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchItem {
    pub id: String,
    pub owner: Option<String>,
    pub platform: String,
    pub entity: String,
    pub operation: String,
    /// `None` follows the engine-wide default criteria
    pub criteria: Option<AlertCriteria>,
    pub snapshot: Option<ListingSnapshot>,
    pub status: WatchStatus,
    pub event_date: Option<DateTime<Utc>>,
    pub high_demand: bool,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: u32,
}

impl WatchItem {
    /// Whether fresh results are still compared for this item
    pub fn is_watching(&self, auto_pause_on_trigger: bool) -> bool {
        match self.status {
            WatchStatus::Active => true,
            WatchStatus::Triggered => !auto_pause_on_trigger,
            WatchStatus::Paused => false,
        }
    }
}

/// Registration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchRequest {
    pub platform: String,
    pub entity: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub criteria: Option<AlertCriteria>,
    #[serde(default)]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub high_demand: bool,
    /// Known listing state to compare the first result against
    #[serde(default)]
    pub baseline: Option<ListingSnapshot>,
}

impl WatchRequest {
    /// Watch an entity with default criteria
    pub fn new(platform: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            entity: entity.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_criteria(mut self, criteria: AlertCriteria) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_event_date(mut self, date: DateTime<Utc>) -> Self {
        self.event_date = Some(date);
        self
    }

    pub fn high_demand(mut self) -> Self {
        self.high_demand = true;
        self
    }

    pub fn with_baseline(mut self, baseline: ListingSnapshot) -> Self {
        self.baseline = Some(baseline);
        self
    }
}

/// Refresh job description for one watched entity
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTarget {
    pub platform: String,
    pub entity: String,
    pub operation: String,
    pub event_date: Option<DateTime<Utc>>,
    pub high_demand: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// Alert emitted for one qualifying change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub item_id: String,
    pub owner: Option<String>,
    pub platform: String,
    pub entity: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Watchlist counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WatchlistStats {
    pub total: usize,
    pub active: usize,
    pub paused: usize,
    pub triggered: usize,
    pub alerts_emitted: u64,
}

// ============================================================================
// Watchlist
// ============================================================================

fn entity_key(platform: &str, entity: &str) -> String {
    format!("{platform}/{entity}")
}

/// Watch item store and comparison engine
pub struct Watchlist {
    items: DashMap<String, Arc<tokio::sync::Mutex<WatchItem>>>,
    by_entity: DashMap<String, BTreeSet<String>>,
    last_alert: DashMap<String, DateTime<Utc>>,
    defaults: RwLock<AlertCriteria>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    history: Mutex<VecDeque<AlertEvent>>,
    emitted: std::sync::atomic::AtomicU64,
    config: WatchlistConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for Watchlist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchlist")
            .field("items", &self.items.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Watchlist {
    /// Create an empty watchlist
    pub fn new(config: WatchlistConfig, clock: SharedClock) -> Self {
        Self {
            items: DashMap::new(),
            by_entity: DashMap::new(),
            last_alert: DashMap::new(),
            defaults: RwLock::new(config.default_criteria.clone()),
            sinks: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            emitted: std::sync::atomic::AtomicU64::new(0),
            config,
            clock,
        }
    }

    /// Register an alert sink
    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        tracing::debug!(sink = sink.name(), "Alert sink registered");
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Criteria applied to items without their own
    pub fn default_criteria(&self) -> AlertCriteria {
        self.defaults
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the default criteria
    pub fn set_default_criteria(&self, criteria: AlertCriteria) -> Result<(), WatchlistError> {
        criteria.validate()?;
        tracing::info!(?criteria, "Default alert thresholds updated");
        *self.defaults.write().unwrap_or_else(|e| e.into_inner()) = criteria;
        Ok(())
    }

    /// Register an entity; re-registering the same owner and entity updates it
    pub async fn add(&self, request: WatchRequest) -> Result<WatchItem, WatchlistError> {
        if request.platform.trim().is_empty() || request.entity.trim().is_empty() {
            return Err(WatchlistError::InvalidCriteria(
                "platform and entity are required".to_string(),
            ));
        }
        if let Some(criteria) = &request.criteria {
            criteria.validate()?;
        }

        let key = entity_key(&request.platform, &request.entity);
        for id in self.ids_for_key(&key) {
            let Some(existing) = self.item_handle(&id) else {
                continue;
            };
            let mut item = existing.lock().await;
            if item.owner == request.owner {
                item.criteria = request.criteria.clone();
                item.event_date = request.event_date.or(item.event_date);
                item.high_demand = request.high_demand;
                if let Some(op) = &request.operation {
                    item.operation = op.clone();
                }
                tracing::info!(item_id = %item.id, entity = %item.entity, "Watch item updated");
                return Ok(item.clone());
            }
        }

        let now = self.clock.now();
        let item = WatchItem {
            id: Uuid::new_v4().to_string(),
            owner: request.owner,
            platform: request.platform,
            entity: request.entity,
            operation: request
                .operation
                .unwrap_or_else(|| DEFAULT_OPERATION.to_string()),
            criteria: request.criteria,
            snapshot: request.baseline,
            status: WatchStatus::Active,
            event_date: request.event_date,
            high_demand: request.high_demand,
            created_at: now,
            last_checked_at: None,
            last_triggered_at: None,
            trigger_count: 0,
        };
        self.insert(item.clone());
        tracing::info!(
            item_id = %item.id,
            platform = %item.platform,
            entity = %item.entity,
            "Watch item registered"
        );
        Ok(item)
    }

    fn insert(&self, item: WatchItem) {
        let key = entity_key(&item.platform, &item.entity);
        self.by_entity
            .entry(key)
            .or_default()
            .insert(item.id.clone());
        self.items
            .insert(item.id.clone(), Arc::new(tokio::sync::Mutex::new(item)));
    }

    fn item_handle(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<WatchItem>>> {
        self.items.get(id).map(|r| Arc::clone(r.value()))
    }

    fn ids_for_key(&self, key: &str) -> Vec<String> {
        self.by_entity
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one item
    pub async fn remove(&self, id: &str) -> Result<WatchItem, WatchlistError> {
        let (_, handle) = self
            .items
            .remove(id)
            .ok_or_else(|| WatchlistError::NotFound(id.to_string()))?;
        let item = handle.lock().await.clone();

        let key = entity_key(&item.platform, &item.entity);
        if let Some(mut ids) = self.by_entity.get_mut(&key) {
            ids.remove(id);
        }
        if self
            .by_entity
            .remove_if(&key, |_, ids| ids.is_empty())
            .is_some()
        {
            self.last_alert.remove(&key);
        }

        tracing::info!(item_id = %id, entity = %item.entity, "Watch item removed");
        Ok(item)
    }

    /// Remove every item watching an entity; returns how many were removed
    pub async fn remove_entity(
        &self,
        platform: &str,
        entity: &str,
    ) -> Result<usize, WatchlistError> {
        let ids = self.ids_for_key(&entity_key(platform, entity));
        if ids.is_empty() {
            return Err(WatchlistError::NotFound(entity_key(platform, entity)));
        }
        let mut removed = 0;
        for id in ids {
            if self.remove(&id).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Look up an item
    pub async fn get(&self, id: &str) -> Option<WatchItem> {
        let handle = self.item_handle(id)?;
        let item = handle.lock().await.clone();
        Some(item)
    }

    /// Every item, oldest first
    pub async fn list(&self) -> Vec<WatchItem> {
        let handles: Vec<_> = self.items.iter().map(|r| Arc::clone(r.value())).collect();
        let mut items = Vec::with_capacity(handles.len());
        for handle in handles {
            items.push(handle.lock().await.clone());
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    async fn set_status(&self, id: &str, status: WatchStatus) -> Result<WatchItem, WatchlistError> {
        let handle = self
            .item_handle(id)
            .ok_or_else(|| WatchlistError::NotFound(id.to_string()))?;
        let mut item = handle.lock().await;
        item.status = status;
        tracing::info!(item_id = %id, status = status.as_str(), "Watch item status changed");
        Ok(item.clone())
    }

    /// Stop comparing results for an item
    pub async fn pause(&self, id: &str) -> Result<WatchItem, WatchlistError> {
        self.set_status(id, WatchStatus::Paused).await
    }

    /// Resume a paused or triggered item
    pub async fn resume(&self, id: &str) -> Result<WatchItem, WatchlistError> {
        self.set_status(id, WatchStatus::Active).await
    }

    /// Whether any item watches the entity
    pub fn is_watched(&self, platform: &str, entity: &str) -> bool {
        self.by_entity.contains_key(&entity_key(platform, entity))
    }

    /// Last alert time for an entity
    pub fn last_triggered(&self, platform: &str, entity: &str) -> Option<DateTime<Utc>> {
        self.last_alert
            .get(&entity_key(platform, entity))
            .map(|at| *at)
    }

    /// Compare a fresh result with every item watching the entity
    ///
    /// Returns the alerts emitted. Items without a previous snapshot only
    /// record the new one.
    pub async fn process_result(
        &self,
        platform: &str,
        entity: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<AlertEvent>, WatchlistError> {
        let key = entity_key(platform, entity);
        let ids = self.ids_for_key(&key);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let current = ListingSnapshot::from_payload(payload, now)?;
        let defaults = self.default_criteria();
        let mut alerts = Vec::new();

        for id in ids {
            let Some(handle) = self.item_handle(&id) else {
                continue;
            };
            let mut item = handle.lock().await;
            if !item.is_watching(self.config.auto_pause_on_trigger) {
                continue;
            }

            let kinds = match &item.snapshot {
                Some(previous) => item
                    .criteria
                    .as_ref()
                    .unwrap_or(&defaults)
                    .evaluate(previous, &current),
                None => Vec::new(),
            };
            item.snapshot = Some(current.clone());
            item.last_checked_at = Some(now);

            if kinds.is_empty() {
                continue;
            }
            item.status = WatchStatus::Triggered;
            item.last_triggered_at = Some(now);
            item.trigger_count += 1;
            self.last_alert.insert(key.clone(), now);

            alerts.extend(kinds.into_iter().map(|kind| AlertEvent {
                id: Uuid::new_v4().to_string(),
                item_id: item.id.clone(),
                owner: item.owner.clone(),
                platform: item.platform.clone(),
                entity: item.entity.clone(),
                severity: kind.severity(),
                message: kind.describe(&item.entity),
                kind,
                created_at: now,
            }));
        }

        for alert in &alerts {
            self.emit(alert).await;
        }
        Ok(alerts)
    }

    async fn emit(&self, alert: &AlertEvent) {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(alert.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        self.emitted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        metrics::record_alert(alert.severity.as_str());

        let sinks: Vec<Arc<dyn AlertSink>> = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for sink in sinks {
            if let Err(e) = sink.deliver(alert).await {
                tracing::warn!(
                    sink = sink.name(),
                    alert_id = %alert.id,
                    error = %e,
                    "Alert delivery failed"
                );
            }
        }
    }

    /// Most recent alerts, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Entities that need a refresh job, one per platform, entity and operation
    pub async fn refresh_targets(&self) -> Vec<WatchTarget> {
        let mut targets: HashMap<(String, String, String), WatchTarget> = HashMap::new();
        for item in self.list().await {
            if !item.is_watching(self.config.auto_pause_on_trigger) {
                continue;
            }
            let key = (item.platform.clone(), item.entity.clone(), item.operation.clone());
            let target = targets.entry(key).or_insert_with(|| WatchTarget {
                platform: item.platform.clone(),
                entity: item.entity.clone(),
                operation: item.operation.clone(),
                event_date: item.event_date,
                high_demand: false,
                last_triggered_at: None,
            });
            target.high_demand |= item.high_demand;
            target.event_date = match (target.event_date, item.event_date) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            target.last_triggered_at = target.last_triggered_at.max(item.last_triggered_at);
        }
        let mut targets: Vec<WatchTarget> = targets.into_values().collect();
        targets.sort_by(|a, b| (&a.platform, &a.entity).cmp(&(&b.platform, &b.entity)));
        targets
    }

    /// Copy of every item for persistence
    pub async fn export(&self) -> Vec<WatchItem> {
        self.list().await
    }

    /// Load persisted items, replacing items with the same id
    pub async fn restore(&self, items: Vec<WatchItem>) -> usize {
        let mut restored = 0;
        for item in items {
            if self.items.contains_key(&item.id) {
                let _ = self.remove(&item.id).await;
            }
            if let Some(at) = item.last_triggered_at {
                let key = entity_key(&item.platform, &item.entity);
                let mut last = self.last_alert.entry(key).or_insert(at);
                if *last < at {
                    *last = at;
                }
            }
            self.insert(item);
            restored += 1;
        }
        tracing::info!(restored, "Watch items restored");
        restored
    }

    /// Item and alert counters
    pub async fn stats(&self) -> WatchlistStats {
        let mut stats = WatchlistStats {
            alerts_emitted: self.emitted.load(std::sync::atomic::Ordering::Relaxed),
            ..Default::default()
        };
        for item in self.list().await {
            stats.total += 1;
            match item.status {
                WatchStatus::Active => stats.active += 1,
                WatchStatus::Paused => stats.paused += 1,
                WatchStatus::Triggered => stats.triggered += 1,
            }
        }
        stats
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no item is registered
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
