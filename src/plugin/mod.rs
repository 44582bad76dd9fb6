//! Scraper plugin capability and registry
//!
//! Marketplace-specific scraping lives outside the engine. Each platform
//! registers one [`ScraperPlugin`]; the registry is built once at startup
//! and only the enabled flags change afterwards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::identity::IdentityLease;
use crate::utils::error::{PluginError, ScrapeErrorKind};

/// Operation name used by plugin self-tests
pub const PROBE_OPERATION: &str = "probe";

/// Outcome of one external scrape call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub success: bool,
    /// Plugin payload; listing snapshots are read from `min_price`,
    /// `available` and `listing_count`
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error_kind: Option<ScrapeErrorKind>,
    #[serde(with = "latency_ms")]
    pub latency: Duration,
}

mod latency_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl ScrapeResult {
    /// Successful result
    pub fn ok(payload: serde_json::Value, latency: Duration) -> Self {
        Self {
            success: true,
            payload,
            error_kind: None,
            latency,
        }
    }

    /// Failed result
    pub fn failed(kind: ScrapeErrorKind, latency: Duration) -> Self {
        Self {
            success: false,
            payload: serde_json::Value::Null,
            error_kind: Some(kind),
            latency,
        }
    }

    /// Failure classification; a failed result without a kind counts as transient
    pub fn failure_kind(&self) -> Option<ScrapeErrorKind> {
        if self.success {
            None
        } else {
            Some(
                self.error_kind
                    .clone()
                    .unwrap_or_else(|| ScrapeErrorKind::transient("unspecified failure")),
            )
        }
    }
}

/// Platform-specific scraper
#[async_trait]
pub trait ScraperPlugin: Send + Sync {
    /// Platform this plugin serves
    fn platform(&self) -> &str;

    /// Perform one operation against a target using the leased identity
    async fn execute(&self, operation: &str, target: &str, identity: &IdentityLease)
        -> ScrapeResult;

    /// Target used by self-tests
    fn probe_target(&self) -> &str {
        "health_check"
    }

    /// Descriptive information
    fn info(&self) -> serde_json::Value {
        serde_json::json!({ "platform": self.platform() })
    }
}

/// Self-test report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginTestReport {
    pub platform: String,
    /// `ok`, `failed`, `disabled` or `no_identity`
    pub status: String,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Registry entry view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginStatus {
    pub enabled: bool,
    pub info: serde_json::Value,
}

struct Registered {
    plugin: Arc<dyn ScraperPlugin>,
    enabled: AtomicBool,
}

/// Platform name to plugin mapping
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Registered>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its platform name, replacing any previous one
    pub fn register(&mut self, plugin: Arc<dyn ScraperPlugin>) {
        let platform = plugin.platform().to_string();
        tracing::info!(platform = %platform, "Scraper plugin registered");
        self.plugins.insert(
            platform,
            Registered {
                plugin,
                enabled: AtomicBool::new(true),
            },
        );
    }

    /// Builder-style registration
    pub fn with_plugin(mut self, plugin: Arc<dyn ScraperPlugin>) -> Self {
        self.register(plugin);
        self
    }

    /// Enabled plugin for a platform
    pub fn get(&self, platform: &str) -> Result<Arc<dyn ScraperPlugin>, PluginError> {
        let entry = self
            .plugins
            .get(platform)
            .ok_or_else(|| PluginError::NotRegistered(platform.to_string()))?;
        if !entry.enabled.load(Ordering::SeqCst) {
            return Err(PluginError::Disabled(platform.to_string()));
        }
        Ok(Arc::clone(&entry.plugin))
    }

    /// Toggle a plugin
    pub fn set_enabled(&self, platform: &str, enabled: bool) -> Result<(), PluginError> {
        let entry = self
            .plugins
            .get(platform)
            .ok_or_else(|| PluginError::NotRegistered(platform.to_string()))?;
        entry.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(platform = %platform, enabled, "Scraper plugin toggled");
        Ok(())
    }

    /// Whether a plugin is registered and enabled
    pub fn is_enabled(&self, platform: &str) -> bool {
        self.plugins
            .get(platform)
            .is_some_and(|e| e.enabled.load(Ordering::SeqCst))
    }

    /// Registered platforms, sorted
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.plugins.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    /// Status of every plugin
    pub fn statuses(&self) -> BTreeMap<String, PluginStatus> {
        self.plugins
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    PluginStatus {
                        enabled: entry.enabled.load(Ordering::SeqCst),
                        info: entry.plugin.info(),
                    },
                )
            })
            .collect()
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoPlugin;

    #[async_trait]
    impl ScraperPlugin for EchoPlugin {
        fn platform(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            operation: &str,
            target: &str,
            _identity: &IdentityLease,
        ) -> ScrapeResult {
            ScrapeResult::ok(
                serde_json::json!({ "operation": operation, "target": target }),
                Duration::from_millis(5),
            )
        }
    }

    #[test]
    fn test_registry_enable_disable() {
        let registry = PluginRegistry::new().with_plugin(Arc::new(EchoPlugin));
        assert!(registry.get("echo").is_ok());

        registry.set_enabled("echo", false).unwrap();
        assert!(matches!(registry.get("echo"), Err(PluginError::Disabled(_))));
        assert!(!registry.is_enabled("echo"));

        registry.set_enabled("echo", true).unwrap();
        assert!(registry.is_enabled("echo"));
    }

    #[test]
    fn test_unknown_platform() {
        let registry = PluginRegistry::new();
        assert_eq!(
            registry.get("ghost").err(),
            Some(PluginError::NotRegistered("ghost".to_string()))
        );
        assert!(registry.set_enabled("ghost", true).is_err());
    }

    #[test]
    fn test_failure_kind_defaults_to_transient() {
        let mut result = ScrapeResult::ok(serde_json::Value::Null, Duration::ZERO);
        assert!(result.failure_kind().is_none());

        result.success = false;
        assert!(matches!(
            result.failure_kind(),
            Some(ScrapeErrorKind::Transient { .. })
        ));
    }

    #[test]
    fn test_result_serializes_latency_ms() {
        let result = ScrapeResult::failed(ScrapeErrorKind::Timeout, Duration::from_millis(1500));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["latency"], 1500);
        assert_eq!(json["error_kind"]["kind"], "timeout");
    }
}
