//! ticketwatch - Scraping orchestration engine for ticket marketplaces
//!
//! Coordinates identity rotation, rate limiting, prioritised job
//! dispatch, result caching, platform health and watchlist alerting for
//! platform-specific scraper plugins.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`identity`] - Identity pool, rotation selector and provisioning collaborator
//! - [`admission`] - Per-platform rate and concurrency governor with circuit breaker
//! - [`scheduler`] - Priority queues, retry/backoff and worker loops
//! - [`cache`] - Layered TTL result cache with tag cascades
//! - [`health`] - Sliding-window health monitor
//! - [`watchlist`] - Watch items, snapshot comparison and alert sinks
//! - [`plugin`] - Scraper plugin trait and registry
//! - [`engine`] - Composition root exposing the administrative operations
//! - [`api`] - axum binding of the administrative operations
//! - [`storage`] - JSON snapshot persistence
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticketwatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let engine = Arc::new(EngineBuilder::new(config).build()?);
//!     engine.provision().await?;
//!     engine.start_monitoring().await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod plugin;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod watchlist;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheKey, InvalidationTarget};
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{EngineErrorTrait, Error, ErrorCategory, Result};
    pub use crate::health::HealthStatus;
    pub use crate::identity::{Identity, IdentityLease, IdentityProvider};
    pub use crate::plugin::{ScrapeResult, ScraperPlugin};
    pub use crate::scheduler::{JobRequest, Priority};
    pub use crate::utils::error::ScrapeErrorKind;
    pub use crate::watchlist::{AlertCriteria, AlertEvent, WatchRequest};
}

// Direct re-exports for convenience
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
