//! Identity pool and rotation
//!
//! Outbound scrape requests are spread over a large set of synthetic
//! identities (fingerprint + optional proxy endpoint) so no single identity
//! accumulates enough traffic to be throttled or flagged.
//!
//! # Modules
//!
//! - [`pool`] - Ownership of identity state, cooldowns, disable/reactivation
//! - [`rotation`] - Weighted, least-recently-used biased selection
//! - [`provider`] - Provisioning collaborator (listing identities, proxy probes)
//!
//! # Lifecycle
//!
//! ```text
//!            failure (< N)            cooldown elapsed
//!   Active ───────────────► Cooling ────────────────► Active
//!     │                                                  ▲
//!     │ N consecutive failures                           │ idle > reactivation_idle
//!     └──────────────────────► Disabled ─────────────────┘
//! ```

pub mod pool;
pub mod provider;
pub mod rotation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use url::Url;

pub use pool::{Candidate, IdentityLease, IdentityPool, PoolConfig, PoolStats};
pub use provider::{
    HttpProxyTester, IdentityProvider, IdentitySeed, ProviderConfig, ProxyHealth,
    StaticIdentityProvider,
};
pub use rotation::{RotationConfig, RotationSelector};

/// Lifecycle status of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    /// Eligible for selection
    #[default]
    Active,
    /// Temporarily benched after a failure
    Cooling,
    /// Benched after too many consecutive failures
    Disabled,
}

impl IdentityStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooling => "cooling",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of an operation performed with an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseOutcome {
    /// Operation succeeded
    Success,
    /// Operation failed (timeout, transient error)
    Failure,
    /// Platform flagged the identity (429/403/challenge)
    Rejected,
}

/// A synthetic actor used to issue outbound requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique identifier
    pub id: String,

    /// Platforms this identity may be used for; empty means any platform
    #[serde(default)]
    pub affinity: BTreeSet<String>,

    /// Proxy endpoint requests are routed through
    #[serde(default)]
    pub proxy: Option<Url>,

    /// Benched until this instant after a failure
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,

    /// Per-platform minimum spacing between uses
    #[serde(default)]
    pub platform_cooldowns: HashMap<String, DateTime<Utc>>,

    /// Consecutive failures since the last success
    #[serde(default)]
    pub consecutive_failures: u32,

    /// Lifetime use count
    #[serde(default)]
    pub total_uses: u64,

    /// Decaying per-platform use counters driving rotation weights
    #[serde(default)]
    pub recent_uses: HashMap<String, u32>,

    /// Current status
    #[serde(default)]
    pub status: IdentityStatus,

    /// Last time the identity was handed out
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,

    /// When the identity was disabled
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Create an active, unaffiliated identity
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            affinity: BTreeSet::new(),
            proxy: None,
            cooldown_until: None,
            platform_cooldowns: HashMap::new(),
            consecutive_failures: 0,
            total_uses: 0,
            recent_uses: HashMap::new(),
            status: IdentityStatus::Active,
            last_used_at: None,
            disabled_at: None,
        }
    }

    /// Restrict the identity to a platform
    pub fn with_affinity(mut self, platform: impl Into<String>) -> Self {
        self.affinity.insert(platform.into());
        self
    }

    /// Route the identity through a proxy
    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Whether the identity may serve the platform at all
    pub fn matches_platform(&self, platform: &str) -> bool {
        self.affinity.is_empty() || self.affinity.contains(platform)
    }

    /// Whether the identity can be handed out for the platform right now
    pub fn is_eligible(&self, platform: &str, now: DateTime<Utc>) -> bool {
        if self.status == IdentityStatus::Disabled || !self.matches_platform(platform) {
            return false;
        }
        if self.cooldown_until.is_some_and(|until| until > now) {
            return false;
        }
        !self
            .platform_cooldowns
            .get(platform)
            .is_some_and(|until| *until > now)
    }

    /// Recent use count for a platform
    pub fn recent_uses_for(&self, platform: &str) -> u32 {
        self.recent_uses.get(platform).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_unaffiliated_matches_any_platform() {
        let identity = Identity::new("id-1");
        assert!(identity.matches_platform("stubhub"));
        assert!(identity.matches_platform("viagogo"));
    }

    #[test]
    fn test_affinity_restricts_platforms() {
        let identity = Identity::new("id-1").with_affinity("stubhub");
        assert!(identity.matches_platform("stubhub"));
        assert!(!identity.matches_platform("viagogo"));
    }

    #[test]
    fn test_eligibility_respects_cooldowns() {
        let now = Utc::now();
        let mut identity = Identity::new("id-1");
        assert!(identity.is_eligible("stubhub", now));

        identity.cooldown_until = Some(now + Duration::seconds(30));
        assert!(!identity.is_eligible("stubhub", now));
        assert!(identity.is_eligible("stubhub", now + Duration::seconds(31)));

        identity.cooldown_until = None;
        identity
            .platform_cooldowns
            .insert("stubhub".to_string(), now + Duration::seconds(10));
        assert!(!identity.is_eligible("stubhub", now));
        assert!(identity.is_eligible("viagogo", now));
    }

    #[test]
    fn test_disabled_never_eligible() {
        let mut identity = Identity::new("id-1");
        identity.status = IdentityStatus::Disabled;
        assert!(!identity.is_eligible("stubhub", Utc::now()));
    }
}
