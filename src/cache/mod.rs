//! Layered result cache
//!
//! Scrape results are cached per `(platform, entity, layer)` with a TTL and
//! a set of tags. Layers are independent namespaces, so clearing one never
//! touches another unless the layer declares it as a dependent.
//!
//! - Layer tags: every entry in a layer carries the layer's default tags
//!   (e.g. `tickets`, `pricing`), so a tag can clear a group of layers.
//! - Dependency tags: tags given to [`ResultCache::put`] link derived
//!   entries. Cascading invalidation of an entry follows its dependency
//!   tags, e.g. clearing a ticket entry tagged `event:42` also clears the
//!   event summary tagged `event:42`.
//!
//! # Example
//!
//! ```rust,ignore
//! use ticketwatch::cache::{CacheKey, InvalidationTarget, ResultCache};
//!
//! let key = CacheKey::new("stubhub", "evt-42", "tickets");
//! cache.put(&key, payload, None, ["event:evt-42"])?;
//! assert!(cache.get(&key).is_some());
//!
//! cache.invalidate(&InvalidationTarget::Key(key), true);
//! ```
//!
//! Caching is advisory: callers ignore cache errors and carry on.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::clock::{to_chrono, SharedClock};
use crate::metrics;
use crate::utils::error::CacheError;

// ============================================================================
// Configuration
// ============================================================================

/// One cache layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Layer name
    pub name: String,

    /// Default TTL (seconds)
    pub ttl_secs: u64,

    /// Tags attached to every entry of the layer
    #[serde(default)]
    pub tags: Vec<String>,

    /// Layers cleared together with this one on cascading layer invalidation
    #[serde(default)]
    pub dependents: Vec<String>,
}

impl LayerConfig {
    fn new(name: &str, ttl_secs: u64, tags: &[&str], dependents: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            ttl_secs,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            dependents: dependents.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Configured layers
    pub layers: Vec<LayerConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layers: vec![
                LayerConfig::new("events", 3600, &["events", "sports"], &["analytics"]),
                LayerConfig::new(
                    "tickets",
                    1800,
                    &["tickets", "pricing"],
                    &["events", "analytics"],
                ),
                LayerConfig::new("monitoring", 300, &["monitoring", "scraping"], &[]),
                LayerConfig::new("system", 86400, &["system", "config"], &[]),
                LayerConfig::new("analytics", 21600, &["analytics", "metrics"], &[]),
            ],
        }
    }
}

impl CacheConfig {
    /// Validate layer definitions
    pub fn validate(&self) -> Result<(), String> {
        let names: HashSet<&str> = self.layers.iter().map(|l| l.name.as_str()).collect();
        if names.len() != self.layers.len() {
            return Err("cache.layers contains duplicate names".to_string());
        }
        for layer in &self.layers {
            if layer.ttl_secs == 0 {
                return Err(format!("cache layer '{}' needs a positive ttl", layer.name));
            }
            for dependent in &layer.dependents {
                if !names.contains(dependent.as_str()) {
                    return Err(format!(
                        "cache layer '{}' depends on unknown layer '{}'",
                        layer.name, dependent
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Keys and Entries
// ============================================================================

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub platform: String,
    pub entity: String,
    pub layer: String,
}

impl CacheKey {
    /// Create a key
    pub fn new(
        platform: impl Into<String>,
        entity: impl Into<String>,
        layer: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            entity: entity.into(),
            layer: layer.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.layer, self.platform, self.entity)
    }
}

/// Stored value with freshness metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
    /// Dependency tags supplied by the writer
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Expiry instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.stored_at + self.ttl
    }

    /// Whether the entry may still be served
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum InvalidationTarget {
    Key(CacheKey),
    Layer(String),
    Tag(String),
    All,
}

// ============================================================================
// Statistics and Reports
// ============================================================================

#[derive(Debug, Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidated: AtomicU64,
}

/// Per-layer statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidated: u64,
    pub hit_rate: f64,
    pub ttl_secs: u64,
}

/// Per-layer counts removed by an invalidation
pub type InvalidationReport = BTreeMap<String, usize>;

/// Result of warming one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmupOutcome {
    pub key: CacheKey,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Warmup results per layer
pub type WarmupReport = BTreeMap<String, Vec<WarmupOutcome>>;

// ============================================================================
// Warmup Producers
// ============================================================================

/// One producer to run during warmup
pub struct WarmupTask {
    pub key: CacheKey,
    pub tags: Vec<String>,
    pub producer: BoxFuture<'static, anyhow::Result<serde_json::Value>>,
}

impl WarmupTask {
    /// Create a task from a future producing the value
    pub fn new<F>(key: CacheKey, producer: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            key,
            tags: Vec::new(),
            producer: Box::pin(producer),
        }
    }

    /// Attach dependency tags
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Source of warmup tasks registered for a layer
#[async_trait]
pub trait CacheWarmer: Send + Sync {
    /// Tasks to run for the layer
    async fn tasks(&self, layer: &str) -> Vec<WarmupTask>;
}

// ============================================================================
// Cache
// ============================================================================

/// Layered in-memory result cache
pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    tag_index: DashMap<String, HashSet<CacheKey>>,
    layers: BTreeMap<String, LayerConfig>,
    counters: BTreeMap<String, LayerCounters>,
    warmers: RwLock<BTreeMap<String, Vec<Arc<dyn CacheWarmer>>>>,
    clock: SharedClock,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.entries.len())
            .field("layers", &self.layers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResultCache {
    /// Create a cache with the configured layers
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        let layers: BTreeMap<String, LayerConfig> = config
            .layers
            .iter()
            .map(|layer| (layer.name.clone(), layer.clone()))
            .collect();
        let counters = layers
            .keys()
            .map(|name| (name.clone(), LayerCounters::default()))
            .collect();
        Self {
            entries: DashMap::new(),
            tag_index: DashMap::new(),
            layers,
            counters,
            warmers: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Configured layer names
    pub fn layer_names(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    fn layer(&self, name: &str) -> Result<&LayerConfig, CacheError> {
        self.layers
            .get(name)
            .ok_or_else(|| CacheError::UnknownLayer(name.to_string()))
    }

    /// Fresh value for the key, `None` on miss
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        self.entry(key).map(|entry| entry.value)
    }

    /// Fresh entry for the key, `None` on miss
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let stored = self.entries.get(key).map(|entry| entry.clone());
        let found = match stored {
            Some(entry) if entry.is_fresh(now) => Some(entry),
            Some(_) => {
                if let Some((_, expired)) = self.entries.remove_if(key, |_, e| !e.is_fresh(now)) {
                    self.unindex_entry(&expired);
                }
                None
            }
            None => None,
        };

        if let Some(counters) = self.counters.get(&key.layer) {
            let counter = if found.is_some() {
                &counters.hits
            } else {
                &counters.misses
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(&key.layer, found.is_some());
        found
    }

    /// Store a value; `ttl` defaults to the layer's TTL
    pub fn put(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Option<std::time::Duration>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), CacheError> {
        let layer = self.layer(&key.layer)?;
        let ttl = ttl.map_or_else(
            || Duration::seconds(layer.ttl_secs as i64),
            to_chrono,
        );
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();

        let entry = CacheEntry {
            key: key.clone(),
            value,
            stored_at: self.clock.now(),
            ttl,
            tags,
        };

        if let Some(previous) = self.entries.insert(key.clone(), entry.clone()) {
            for tag in previous.tags.difference(&entry.tags) {
                self.unindex(tag, key);
            }
        }
        for tag in layer.tags.iter().chain(entry.tags.iter()) {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        Ok(())
    }

    fn unindex(&self, tag: &str, key: &CacheKey) {
        if let Some(mut keys) = self.tag_index.get_mut(tag) {
            keys.remove(key);
        }
        self.tag_index.remove_if(tag, |_, keys| keys.is_empty());
    }

    fn remove_key(&self, key: &CacheKey) -> Option<CacheEntry> {
        let (_, entry) = self.entries.remove(key)?;
        self.unindex_entry(&entry);
        Some(entry)
    }

    fn unindex_entry(&self, entry: &CacheEntry) {
        let layer_tags = self
            .layers
            .get(&entry.key.layer)
            .map(|layer| layer.tags.as_slice())
            .unwrap_or_default();
        for tag in layer_tags.iter().chain(entry.tags.iter()) {
            self.unindex(tag, &entry.key);
        }
    }

    fn keys_for_tag(&self, tag: &str) -> Vec<CacheKey> {
        self.tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn keys_in_layer(&self, layer: &str) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key().layer == layer)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Invalidate entries; returns per-layer removal counts
    ///
    /// With `cascade`, a key or tag invalidation also clears every entry
    /// reachable through the removed entries' dependency tags, and a layer
    /// invalidation also clears the layer's dependent layers.
    pub fn invalidate(&self, target: &InvalidationTarget, cascade: bool) -> InvalidationReport {
        let mut report = InvalidationReport::new();
        match target {
            InvalidationTarget::All => {
                for layer in self.layers.keys() {
                    self.clear_layer(layer, &mut report);
                }
            }
            InvalidationTarget::Layer(layer) => {
                self.clear_layer(layer, &mut report);
                if cascade {
                    let dependents = self
                        .layers
                        .get(layer)
                        .map(|l| l.dependents.clone())
                        .unwrap_or_default();
                    for dependent in dependents {
                        self.clear_layer(&dependent, &mut report);
                    }
                }
            }
            InvalidationTarget::Key(key) => {
                self.remove_walk(vec![key.clone()], Vec::new(), cascade, &mut report);
            }
            InvalidationTarget::Tag(tag) => {
                self.remove_walk(Vec::new(), vec![tag.clone()], cascade, &mut report);
            }
        }

        let total: usize = report.values().sum();
        if total > 0 {
            tracing::debug!(target = ?target, cascade, total, "Cache invalidated");
        }
        report
    }

    fn clear_layer(&self, layer: &str, report: &mut InvalidationReport) {
        let mut removed = 0;
        for key in self.keys_in_layer(layer) {
            if self.remove_key(&key).is_some() {
                removed += 1;
            }
        }
        self.note_invalidated(layer, removed, report);
    }

    fn remove_walk(
        &self,
        keys: Vec<CacheKey>,
        tags: Vec<String>,
        cascade: bool,
        report: &mut InvalidationReport,
    ) {
        let mut pending_keys: VecDeque<CacheKey> = keys.into();
        let mut pending_tags: VecDeque<String> = tags.into();
        let mut seen_tags: HashSet<String> = pending_tags.iter().cloned().collect();

        loop {
            if let Some(key) = pending_keys.pop_front() {
                let Some(entry) = self.remove_key(&key) else {
                    continue;
                };
                self.note_invalidated(&key.layer, 1, report);
                if cascade {
                    for tag in entry.tags {
                        if seen_tags.insert(tag.clone()) {
                            pending_tags.push_back(tag);
                        }
                    }
                }
            } else if let Some(tag) = pending_tags.pop_front() {
                pending_keys.extend(self.keys_for_tag(&tag));
            } else {
                break;
            }
        }
    }

    fn note_invalidated(&self, layer: &str, removed: usize, report: &mut InvalidationReport) {
        if removed == 0 && !self.layers.contains_key(layer) {
            return;
        }
        *report.entry(layer.to_string()).or_insert(0) += removed;
        if let Some(counters) = self.counters.get(layer) {
            counters
                .invalidated
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
    }

    /// Drop expired entries; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_fresh(now))
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| self.entries.remove_if(key, |_, e| !e.is_fresh(now)))
            .map(|(_, entry)| self.unindex_entry(&entry))
            .count()
    }

    /// Register a warmer for a layer
    pub fn register_warmer(
        &self,
        layer: &str,
        warmer: Arc<dyn CacheWarmer>,
    ) -> Result<(), CacheError> {
        self.layer(layer)?;
        let mut warmers = self.warmers.write().unwrap_or_else(|e| e.into_inner());
        warmers.entry(layer.to_string()).or_default().push(warmer);
        Ok(())
    }

    /// Run registered warmers for the given layers (all layers when empty)
    pub async fn warmup(&self, layers: &[String]) -> Result<WarmupReport, CacheError> {
        let selected: Vec<String> = if layers.is_empty() {
            self.layer_names()
        } else {
            for layer in layers {
                self.layer(layer)?;
            }
            layers.to_vec()
        };

        let mut report = WarmupReport::new();
        for layer in selected {
            let warmers = {
                let warmers = self.warmers.read().unwrap_or_else(|e| e.into_inner());
                warmers.get(&layer).cloned().unwrap_or_default()
            };
            let mut tasks = Vec::new();
            for warmer in warmers {
                tasks.extend(warmer.tasks(&layer).await);
            }
            let outcomes = self.warmup_with(&layer, tasks).await?;
            report.insert(layer, outcomes);
        }
        Ok(report)
    }

    /// Run producers for one layer concurrently, storing each success
    ///
    /// A failing producer only affects its own key.
    pub async fn warmup_with(
        &self,
        layer: &str,
        tasks: Vec<WarmupTask>,
    ) -> Result<Vec<WarmupOutcome>, CacheError> {
        self.layer(layer)?;

        let runs = tasks.into_iter().map(|task| async move {
            let started = Instant::now();
            let result = task.producer.await;
            (task.key, task.tags, result, started.elapsed())
        });

        let mut outcomes = Vec::new();
        for (key, tags, result, elapsed) in join_all(runs).await {
            let elapsed_ms = elapsed.as_millis() as u64;
            let stored = match result {
                Ok(value) if key.layer == layer => self.put(&key, value, None, tags),
                Ok(_) => Err(CacheError::UnknownLayer(key.layer.clone())),
                Err(e) => Err(CacheError::ProducerFailed {
                    layer: layer.to_string(),
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            };
            match stored {
                Ok(()) => outcomes.push(WarmupOutcome {
                    key,
                    success: true,
                    error: None,
                    elapsed_ms,
                }),
                Err(e) => {
                    tracing::warn!(
                        layer = %layer,
                        key = %key,
                        error = %e,
                        "Cache warmup failed for key"
                    );
                    outcomes.push(WarmupOutcome {
                        key,
                        success: false,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    });
                }
            }
        }

        let warmed = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(layer = %layer, warmed, total = outcomes.len(), "Cache layer warmed");
        Ok(outcomes)
    }

    /// Statistics per layer
    pub fn stats(&self) -> BTreeMap<String, LayerStats> {
        let mut entries: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.entries.iter() {
            *entries.entry(entry.key().layer.clone()).or_insert(0) += 1;
        }

        self.layers
            .iter()
            .map(|(name, layer)| {
                let counters = &self.counters[name];
                let hits = counters.hits.load(Ordering::Relaxed);
                let misses = counters.misses.load(Ordering::Relaxed);
                let lookups = hits + misses;
                (
                    name.clone(),
                    LayerStats {
                        entries: entries.get(name).copied().unwrap_or(0),
                        hits,
                        misses,
                        invalidated: counters.invalidated.load(Ordering::Relaxed),
                        hit_rate: if lookups == 0 {
                            0.0
                        } else {
                            hits as f64 / lookups as f64
                        },
                        ttl_secs: layer.ttl_secs,
                    },
                )
            })
            .collect()
    }

    /// Number of stored entries, fresh or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn cache() -> (ResultCache, ManualClock) {
        let clock = ManualClock::starting_now();
        (
            ResultCache::new(&CacheConfig::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    fn no_tags() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn test_round_trip_and_ttl() {
        let (cache, clock) = cache();
        let key = CacheKey::new("stubhub", "evt-1", "tickets");
        cache
            .put(
                &key,
                json!({"min_price": 120}),
                Some(std::time::Duration::from_secs(60)),
                no_tags(),
            )
            .unwrap();

        assert_eq!(cache.get(&key), Some(json!({"min_price": 120})));
        clock.advance(Duration::seconds(59));
        assert!(cache.get(&key).is_some());
        clock.advance(Duration::seconds(1));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_layer_default_ttl() {
        let (cache, clock) = cache();
        let key = CacheKey::new("stubhub", "evt-1", "monitoring");
        cache.put(&key, json!(1), None, no_tags()).unwrap();
        clock.advance(Duration::seconds(299));
        assert!(cache.get(&key).is_some());
        clock.advance(Duration::seconds(2));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_unknown_layer_rejected() {
        let (cache, _) = cache();
        let key = CacheKey::new("stubhub", "evt-1", "nope");
        assert_eq!(
            cache.put(&key, json!(1), None, no_tags()),
            Err(CacheError::UnknownLayer("nope".to_string()))
        );
    }

    #[test]
    fn test_tag_invalidation_spares_untagged() {
        let (cache, _) = cache();
        let a = CacheKey::new("stubhub", "t-1", "tickets");
        let b = CacheKey::new("stubhub", "evt-1", "events");
        let c = CacheKey::new("stubhub", "evt-2", "events");
        cache.put(&a, json!("a"), None, ["event:evt-1"]).unwrap();
        cache.put(&b, json!("b"), None, ["event:evt-1"]).unwrap();
        cache.put(&c, json!("c"), None, ["event:evt-2"]).unwrap();

        let report = cache.invalidate(&InvalidationTarget::Tag("event:evt-1".into()), false);
        assert_eq!(report.get("tickets"), Some(&1));
        assert_eq!(report.get("events"), Some(&1));
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_none());
        assert_eq!(cache.get(&c), Some(json!("c")));
    }

    #[test]
    fn test_key_cascade_follows_dependency_tags() {
        let (cache, _) = cache();
        let ticket = CacheKey::new("stubhub", "t-1", "tickets");
        let summary = CacheKey::new("stubhub", "evt-1", "events");
        let other = CacheKey::new("stubhub", "t-2", "tickets");
        cache.put(&ticket, json!(1), None, ["event:evt-1"]).unwrap();
        cache.put(&summary, json!(2), None, ["event:evt-1"]).unwrap();
        cache.put(&other, json!(3), None, ["event:evt-9"]).unwrap();

        cache.invalidate(&InvalidationTarget::Key(ticket.clone()), false);
        assert!(cache.get(&summary).is_some());

        cache.put(&ticket, json!(1), None, ["event:evt-1"]).unwrap();
        cache.invalidate(&InvalidationTarget::Key(ticket.clone()), true);
        assert!(cache.get(&ticket).is_none());
        assert!(cache.get(&summary).is_none());
        assert!(cache.get(&other).is_some());
    }

    #[test]
    fn test_layer_cascade_is_one_level() {
        let (cache, _) = cache();
        let ticket = CacheKey::new("stubhub", "t-1", "tickets");
        let event = CacheKey::new("stubhub", "evt-1", "events");
        let system = CacheKey::new("global", "settings", "system");
        cache.put(&ticket, json!(1), None, no_tags()).unwrap();
        cache.put(&event, json!(2), None, no_tags()).unwrap();
        cache.put(&system, json!(3), None, no_tags()).unwrap();

        let report = cache.invalidate(&InvalidationTarget::Layer("events".into()), false);
        assert_eq!(report.get("events"), Some(&1));
        assert!(cache.get(&ticket).is_some());

        cache.put(&event, json!(2), None, no_tags()).unwrap();
        let report = cache.invalidate(&InvalidationTarget::Layer("tickets".into()), true);
        assert_eq!(report.get("tickets"), Some(&1));
        assert_eq!(report.get("events"), Some(&1));
        assert_eq!(report.get("analytics"), Some(&0));
        assert!(cache.get(&system).is_some());
    }

    #[test]
    fn test_overwrite_drops_stale_tags() {
        let (cache, _) = cache();
        let key = CacheKey::new("stubhub", "t-1", "tickets");
        cache.put(&key, json!(1), None, ["event:old"]).unwrap();
        cache.put(&key, json!(2), None, ["event:new"]).unwrap();

        cache.invalidate(&InvalidationTarget::Tag("event:old".into()), false);
        assert_eq!(cache.get(&key), Some(json!(2)));
    }

    #[test]
    fn test_stats_and_purge() {
        let (cache, clock) = cache();
        let key = CacheKey::new("stubhub", "evt-1", "monitoring");
        cache.put(&key, json!(1), None, no_tags()).unwrap();
        cache.get(&key);
        cache.get(&CacheKey::new("stubhub", "missing", "monitoring"));

        let stats = cache.stats();
        assert_eq!(stats["monitoring"].hits, 1);
        assert_eq!(stats["monitoring"].misses, 1);
        assert_eq!(stats["monitoring"].entries, 1);
        assert_eq!(stats["monitoring"].hit_rate, 0.5);

        clock.advance(Duration::minutes(10));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_warmup_isolates_failures() {
        let (cache, _) = cache();
        let good = CacheKey::new("stubhub", "evt-1", "events");
        let bad = CacheKey::new("stubhub", "evt-2", "events");
        let tasks = vec![
            WarmupTask::new(good.clone(), async { Ok(json!({"name": "Final"})) }),
            WarmupTask::new(bad.clone(), async { anyhow::bail!("upstream 500") }),
        ];

        let outcomes = cache.warmup_with("events", tasks).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.key == good && o.success));
        assert!(outcomes
            .iter()
            .any(|o| o.key == bad && !o.success && o.error.as_deref().unwrap().contains("500")));
        assert!(cache.get(&good).is_some());
        assert!(cache.get(&bad).is_none());
    }

    struct StaticWarmer;

    #[async_trait]
    impl CacheWarmer for StaticWarmer {
        async fn tasks(&self, layer: &str) -> Vec<WarmupTask> {
            vec![WarmupTask::new(
                CacheKey::new("global", "settings", layer),
                async { Ok(json!({"refresh": 300})) },
            )]
        }
    }

    #[tokio::test]
    async fn test_registered_warmer_runs() {
        let (cache, _) = cache();
        cache.register_warmer("system", Arc::new(StaticWarmer)).unwrap();

        let report = cache.warmup(&["system".to_string()]).await.unwrap();
        assert_eq!(report["system"].len(), 1);
        assert!(cache
            .get(&CacheKey::new("global", "settings", "system"))
            .is_some());

        assert!(cache.warmup(&["nope".to_string()]).await.is_err());
    }

    #[test]
    fn test_default_config_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        let mut config = CacheConfig::default();
        config.layers[0].dependents.push("ghost".into());
        assert!(config.validate().is_err());
    }
}
