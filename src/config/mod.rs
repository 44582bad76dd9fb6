//! Configuration management for the ticketwatch engine
//!
//! Configuration comes from a TOML file or from `TICKETWATCH_*` environment
//! variables layered over the defaults. Every section falls back to its
//! defaults when omitted, so a file only needs the values it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admission::AdmissionConfig;
use crate::cache::CacheConfig;
use crate::health::HealthConfig;
use crate::identity::{PoolConfig, ProviderConfig, RotationConfig};
use crate::scheduler::SchedulerConfig;
use crate::watchlist::WatchlistConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity pool thresholds
    pub pool: PoolConfig,

    /// Rotation selector tuning
    pub rotation: RotationConfig,

    /// Identity provisioning and proxy probes
    pub provider: ProviderConfig,

    /// Rate and concurrency governor
    pub admission: AdmissionConfig,

    /// Priority scheduler and workers
    pub scheduler: SchedulerConfig,

    /// Result cache layers
    pub cache: CacheConfig,

    /// Health monitor thresholds
    pub health: HealthConfig,

    /// Watchlist and alerting
    pub watchlist: WatchlistConfig,

    /// Snapshot persistence
    pub storage: StorageConfig,

    /// Admin HTTP server
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot file; `None` disables persistence
    pub snapshot_path: Option<PathBuf>,

    /// Interval between snapshots (seconds)
    pub snapshot_interval_secs: u64,

    /// Interval between housekeeping passes (seconds)
    pub housekeeping_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: Some(PathBuf::from("data/ticketwatch-snapshot.json")),
            snapshot_interval_secs: 60,
            housekeeping_interval_secs: 30,
        }
    }
}

/// Admin HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Allowed CORS origins; empty allows any origin
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

impl EngineConfig {
    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Override values from `TICKETWATCH_*` environment variables
    pub fn apply_env(&mut self) {
        if let Some(platforms) = env_list("TICKETWATCH_PLATFORMS") {
            self.scheduler.platforms = platforms;
        }
        if let Some(workers) = env_parse("TICKETWATCH_WORKERS_PER_PLATFORM") {
            self.scheduler.workers_per_platform = workers;
        }
        if let Some(secs) = env_parse("TICKETWATCH_MONITORING_INTERVAL") {
            self.scheduler.monitoring_interval_secs = secs;
        }
        if let Some(secs) = env_parse("TICKETWATCH_OPERATION_TIMEOUT") {
            self.scheduler.operation_timeout_secs = secs;
        }
        if let Some(attempts) = env_parse("TICKETWATCH_MAX_ATTEMPTS") {
            self.scheduler.max_attempts = attempts;
        }
        if let Some(rate) = env_parse("TICKETWATCH_RATE_LIMIT") {
            self.admission.default.rate_per_sec = rate;
        }
        if let Some(concurrency) = env_parse("TICKETWATCH_MAX_CONCURRENCY") {
            self.admission.default.max_concurrency = concurrency;
        }
        if let Some(threshold) = env_parse("TICKETWATCH_DISABLE_THRESHOLD") {
            self.pool.disable_threshold = threshold;
        }
        if let Ok(path) = std::env::var("TICKETWATCH_SNAPSHOT_PATH") {
            self.storage.snapshot_path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
        if let Ok(host) = std::env::var("TICKETWATCH_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("TICKETWATCH_SERVER_PORT") {
            self.server.port = port;
        }
        if let Ok(level) = std::env::var("TICKETWATCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TICKETWATCH_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pool.disable_threshold == 0 {
            anyhow::bail!("pool.disable_threshold must be greater than 0");
        }
        if self.pool.cooldown_base_secs > self.pool.cooldown_cap_secs {
            anyhow::bail!("pool.cooldown_base_secs must not exceed pool.cooldown_cap_secs");
        }
        if self.provider.probe_timeout_secs == 0 {
            anyhow::bail!("provider.probe_timeout_secs must be greater than 0");
        }

        self.admission.validate().map_err(anyhow::Error::msg)?;
        self.scheduler.validate().map_err(anyhow::Error::msg)?;
        self.cache.validate().map_err(anyhow::Error::msg)?;
        self.health.validate().map_err(anyhow::Error::msg)?;
        self.watchlist.validate().map_err(anyhow::Error::msg)?;

        if self.storage.snapshot_interval_secs == 0
            || self.storage.housekeeping_interval_secs == 0
        {
            anyhow::bail!("storage intervals must be greater than 0");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }
        self.server.bind_addr()?;

        Ok(())
    }

    /// Per-operation timeout as Duration
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.operation_timeout_secs)
    }

    /// Watch refresh interval as Duration
    #[must_use]
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.monitoring_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.disable_threshold, 5);
        assert_eq!(config.pool.cooldown_cap_secs, 900);
        assert_eq!(config.pool.reactivation_idle_secs, 3600);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.pool.disable_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.format = String::from("xml");
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.health.critical_threshold = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [scheduler]
            platforms = ["stubhub", "viagogo"]
            workers_per_platform = 4

            [admission.platforms.stubhub]
            rate_per_sec = 0.5
            max_concurrency = 2

            [server]
            port = 9090
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.platforms, vec!["stubhub", "viagogo"]);
        assert_eq!(config.scheduler.workers_per_platform, 4);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.admission.limits_for("stubhub").max_concurrency, 2);
        assert_eq!(config.admission.limits_for("stubhub").burst, 5);
        assert_eq!(config.server.port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[health]\nhysteresis = 5\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.health.hysteresis, 5);
        assert!(EngineConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let config = EngineConfig::default();
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.monitoring_interval(), Duration::from_secs(300));
    }
}
