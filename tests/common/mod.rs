//! Common test utilities

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ticketwatch::clock::{ManualClock, SharedClock};
use ticketwatch::config::EngineConfig;
use ticketwatch::engine::{Engine, EngineBuilder};
use ticketwatch::identity::{IdentityLease, IdentitySeed};
use ticketwatch::plugin::{ScrapeResult, ScraperPlugin};

pub const PLATFORM: &str = "stubhub";

/// Plugin returning scripted results per target
///
/// Targets without a script get the default result. Every call is recorded
/// in order.
pub struct ScriptedPlugin {
    platform: String,
    default: ScrapeResult,
    scripts: Mutex<HashMap<String, VecDeque<ScrapeResult>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPlugin {
    pub fn new(platform: &str, default: ScrapeResult) -> Self {
        Self {
            platform: platform.to_string(),
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Plugin that always reports one available listing
    pub fn listing(platform: &str) -> Self {
        Self::new(platform, ScrapeResult::ok(listing_payload(50.0, 1), Duration::from_millis(5)))
    }

    /// Queue results returned for a target before falling back to the default
    #[allow(dead_code)]
    pub fn script(&self, target: &str, results: impl IntoIterator<Item = ScrapeResult>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .extend(results);
    }

    /// Targets in execution order
    #[allow(dead_code)]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScraperPlugin for ScriptedPlugin {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn execute(
        &self,
        _operation: &str,
        target: &str,
        _identity: &IdentityLease,
    ) -> ScrapeResult {
        self.calls.lock().unwrap().push(target.to_string());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

/// Payload in the shape the watchlist reads
pub fn listing_payload(min_price: f64, listing_count: u32) -> serde_json::Value {
    serde_json::json!({
        "min_price": min_price,
        "available": listing_count > 0,
        "listing_count": listing_count,
    })
}

/// Configuration with a roomy budget, no persistence and `identities` static identities
pub fn test_config(identities: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.snapshot_path = None;
    config.rotation.min_spacing_secs = 0;
    config.rotation.seed = Some(7);
    config.admission.default.rate_per_sec = 1000.0;
    config.admission.default.burst = 1000;
    config.scheduler.platforms = vec![PLATFORM.to_string()];
    config.provider.identities = (0..identities)
        .map(|i| IdentitySeed {
            id: format!("identity-{i}"),
            affinity: Vec::new(),
            proxy: None,
        })
        .collect();
    config
}

/// Build and provision an engine around a plugin
pub async fn build_engine(
    config: EngineConfig,
    plugin: Arc<ScriptedPlugin>,
    clock: Option<Arc<ManualClock>>,
) -> Arc<Engine> {
    let mut builder = EngineBuilder::new(config).with_plugin(plugin);
    if let Some(clock) = clock {
        let shared: SharedClock = clock;
        builder = builder.with_clock(shared);
    }
    let engine = Arc::new(builder.build().expect("engine builds"));
    engine.provision().await.expect("identities provisioned");
    engine
}
