//! Identity pool
//!
//! Owns every [`Identity`] and is the only place their state changes.
//! Identities are stored in a sharded map so concurrent acquire/release
//! calls for different identities never contend on a single lock, and are
//! indexed by affinity tag so lookups only scan relevant partitions.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{Identity, IdentityStatus, ReleaseOutcome};
use crate::clock::{to_chrono, SharedClock};
use crate::utils::error::PoolError;

/// Partition key for identities without platform affinity
const UNAFFILIATED: &str = "*";

/// Identity pool tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Consecutive failures before an identity is disabled
    pub disable_threshold: u32,

    /// Cooldown after the first failure (seconds)
    pub cooldown_base_secs: u64,

    /// Upper bound for the exponential cooldown (seconds)
    pub cooldown_cap_secs: u64,

    /// Idle time after which a disabled identity is re-admitted (seconds)
    pub reactivation_idle_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            disable_threshold: 5,
            cooldown_base_secs: 30,
            cooldown_cap_secs: 900,      // 15 minutes
            reactivation_idle_secs: 3600, // 1 hour
        }
    }
}

impl PoolConfig {
    /// Cooldown for the given failure streak, doubled per failure and capped
    pub fn cooldown_for(&self, consecutive_failures: u32, escalated: bool) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1) + u32::from(escalated);
        let factor = 2_u64.saturating_pow(exponent.min(32));
        let secs = self
            .cooldown_base_secs
            .saturating_mul(factor)
            .min(self.cooldown_cap_secs);
        Duration::seconds(secs as i64)
    }

    /// Reactivation idle time as a chrono duration
    pub fn reactivation_idle(&self) -> Duration {
        to_chrono(std::time::Duration::from_secs(self.reactivation_idle_secs))
    }
}

/// An identity checked out for one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityLease {
    /// Snapshot of the identity at checkout
    pub identity: Identity,
    /// Platform the lease was taken for
    pub platform: String,
    /// Operation the lease was taken for
    pub operation: String,
    /// Checkout time
    pub acquired_at: DateTime<Utc>,
}

impl IdentityLease {
    /// Identity id
    pub fn id(&self) -> &str {
        &self.identity.id
    }
}

/// Identity counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub cooling: usize,
    pub disabled: usize,
}

/// Candidate handed to the rotation selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub recent_uses: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Pool of synthetic identities
#[derive(Debug)]
pub struct IdentityPool {
    identities: DashMap<String, Identity>,
    partitions: DashMap<String, BTreeSet<String>>,
    config: PoolConfig,
    clock: SharedClock,
}

impl IdentityPool {
    /// Create an empty pool
    pub fn new(config: PoolConfig, clock: SharedClock) -> Self {
        Self {
            identities: DashMap::new(),
            partitions: DashMap::new(),
            config,
            clock,
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add identities, skipping ids already present. Returns the number added.
    pub fn expand(&self, identities: impl IntoIterator<Item = Identity>) -> usize {
        let mut added = 0;
        for identity in identities {
            if self.identities.contains_key(&identity.id) {
                continue;
            }
            self.index(&identity);
            self.identities.insert(identity.id.clone(), identity);
            added += 1;
        }
        if added > 0 {
            tracing::info!(added, total = self.identities.len(), "Identity pool expanded");
        }
        added
    }

    fn index(&self, identity: &Identity) {
        if identity.affinity.is_empty() {
            self.partitions
                .entry(UNAFFILIATED.to_string())
                .or_default()
                .insert(identity.id.clone());
        } else {
            for platform in &identity.affinity {
                self.partitions
                    .entry(platform.clone())
                    .or_default()
                    .insert(identity.id.clone());
            }
        }
    }

    fn partition_ids(&self, platform: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for key in [platform, UNAFFILIATED] {
            if let Some(partition) = self.partitions.get(key) {
                ids.extend(partition.iter().cloned());
            }
        }
        ids
    }

    /// Identities currently eligible for the platform
    pub fn candidates(&self, platform: &str) -> Vec<Candidate> {
        let now = self.clock.now();
        self.partition_ids(platform)
            .into_iter()
            .filter_map(|id| {
                let identity = self.identities.get(&id)?;
                identity.is_eligible(platform, now).then(|| Candidate {
                    id: identity.id.clone(),
                    recent_uses: identity.recent_uses_for(platform),
                    last_used_at: identity.last_used_at,
                })
            })
            .collect()
    }

    /// Acquire the least recently used eligible identity
    ///
    /// `Exhausted` is backpressure: the caller should retry later.
    pub fn acquire(&self, platform: &str, operation: &str) -> Result<IdentityLease, PoolError> {
        let mut candidates = self.candidates(platform);
        candidates.sort_by(|a, b| {
            a.recent_uses
                .cmp(&b.recent_uses)
                .then(a.last_used_at.cmp(&b.last_used_at))
        });

        for candidate in candidates {
            if let Some(lease) = self.checkout(&candidate.id, platform, operation, Duration::zero())
            {
                return Ok(lease);
            }
        }

        Err(PoolError::Exhausted {
            platform: platform.to_string(),
        })
    }

    /// Check out a specific identity if it is still eligible
    ///
    /// Eligibility is re-checked under the identity's entry lock, so two
    /// racing callers can never both check out an identity whose spacing
    /// window forbids it.
    pub fn checkout(
        &self,
        id: &str,
        platform: &str,
        operation: &str,
        spacing: Duration,
    ) -> Option<IdentityLease> {
        let now = self.clock.now();
        let mut identity = self.identities.get_mut(id)?;
        if !identity.is_eligible(platform, now) {
            return None;
        }

        if identity.status == IdentityStatus::Cooling {
            identity.status = IdentityStatus::Active;
            identity.cooldown_until = None;
        }
        identity.total_uses += 1;
        *identity.recent_uses.entry(platform.to_string()).or_insert(0) += 1;
        identity.last_used_at = Some(now);
        if spacing > Duration::zero() {
            identity
                .platform_cooldowns
                .insert(platform.to_string(), now + spacing);
        }

        tracing::debug!(
            identity = %identity.id,
            platform = %platform,
            operation = %operation,
            "Identity checked out"
        );

        Some(IdentityLease {
            identity: identity.clone(),
            platform: platform.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
        })
    }

    /// Report the outcome of an operation performed with an identity
    pub fn release(&self, id: &str, outcome: ReleaseOutcome) -> Result<IdentityStatus, PoolError> {
        let now = self.clock.now();
        let mut identity = self
            .identities
            .get_mut(id)
            .ok_or_else(|| PoolError::UnknownIdentity(id.to_string()))?;

        match outcome {
            ReleaseOutcome::Success => {
                identity.consecutive_failures = 0;
                if identity.status != IdentityStatus::Disabled {
                    identity.status = IdentityStatus::Active;
                    identity.cooldown_until = None;
                }
            }
            ReleaseOutcome::Failure | ReleaseOutcome::Rejected => {
                identity.consecutive_failures += 1;
                if identity.consecutive_failures >= self.config.disable_threshold {
                    if identity.status != IdentityStatus::Disabled {
                        tracing::info!(
                            identity = %identity.id,
                            failures = identity.consecutive_failures,
                            "Identity disabled after consecutive failures"
                        );
                    }
                    identity.status = IdentityStatus::Disabled;
                    identity.disabled_at = Some(now);
                    identity.cooldown_until = None;
                } else {
                    let cooldown = self.config.cooldown_for(
                        identity.consecutive_failures,
                        outcome == ReleaseOutcome::Rejected,
                    );
                    identity.status = IdentityStatus::Cooling;
                    identity.cooldown_until = Some(now + cooldown);
                }
            }
        }

        Ok(identity.status)
    }

    /// Periodic maintenance pass
    ///
    /// Re-admits disabled identities idle beyond the reactivation window,
    /// returns cooled-down identities to active, halves recent-use counters
    /// and drops elapsed spacing windows. The failure streak of a
    /// re-admitted identity is kept, so one more failure disables it again.
    /// Returns the number of re-admitted identities.
    pub fn reconcile(&self) -> usize {
        let now = self.clock.now();
        let idle = self.config.reactivation_idle();
        let mut readmitted = 0;

        for mut entry in self.identities.iter_mut() {
            let identity = entry.value_mut();
            match identity.status {
                IdentityStatus::Disabled => {
                    let idle_since = identity
                        .last_used_at
                        .into_iter()
                        .chain(identity.disabled_at)
                        .max();
                    if idle_since.map_or(true, |since| now - since >= idle) {
                        identity.status = IdentityStatus::Active;
                        identity.disabled_at = None;
                        readmitted += 1;
                        tracing::info!(identity = %identity.id, "Disabled identity re-admitted");
                    }
                }
                IdentityStatus::Cooling => {
                    if identity.cooldown_until.map_or(true, |until| until <= now) {
                        identity.status = IdentityStatus::Active;
                        identity.cooldown_until = None;
                    }
                }
                IdentityStatus::Active => {}
            }

            identity.platform_cooldowns.retain(|_, until| *until > now);
            identity.recent_uses.retain(|_, uses| {
                *uses /= 2;
                *uses > 0
            });
        }

        readmitted
    }

    /// Snapshot of one identity
    pub fn get(&self, id: &str) -> Option<Identity> {
        self.identities.get(id).map(|i| i.clone())
    }

    /// Snapshot of every identity
    pub fn all(&self) -> Vec<Identity> {
        let mut all: Vec<Identity> = self.identities.iter().map(|i| i.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Replace stored state for identities present in the snapshot, adding unknown ones
    pub fn restore(&self, identities: Vec<Identity>) -> usize {
        let count = identities.len();
        for identity in identities {
            if !self.identities.contains_key(&identity.id) {
                self.index(&identity);
            }
            self.identities.insert(identity.id.clone(), identity);
        }
        count
    }

    /// Counts by status
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for identity in self.identities.iter() {
            stats.total += 1;
            match identity.status {
                IdentityStatus::Active => stats.active += 1,
                IdentityStatus::Cooling => stats.cooling += 1,
                IdentityStatus::Disabled => stats.disabled += 1,
            }
        }
        stats
    }

    /// Number of identities
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether the pool holds no identities
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn pool_with(clock: &ManualClock, identities: Vec<Identity>) -> IdentityPool {
        let pool = IdentityPool::new(PoolConfig::default(), Arc::new(clock.clone()));
        pool.expand(identities);
        pool
    }

    #[test]
    fn test_cooldown_exponential_and_capped() {
        let config = PoolConfig::default();
        assert_eq!(config.cooldown_for(1, false), Duration::seconds(30));
        assert_eq!(config.cooldown_for(2, false), Duration::seconds(60));
        assert_eq!(config.cooldown_for(3, false), Duration::seconds(120));
        assert_eq!(config.cooldown_for(2, true), Duration::seconds(120));
        assert_eq!(config.cooldown_for(30, false), Duration::seconds(900));
    }

    #[test]
    fn test_acquire_filters_affinity() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(
            &clock,
            vec![Identity::new("sh-1").with_affinity("stubhub")],
        );

        assert!(pool.acquire("stubhub", "search").is_ok());
        assert_eq!(
            pool.acquire("viagogo", "search"),
            Err(PoolError::Exhausted {
                platform: "viagogo".to_string()
            })
        );
    }

    #[test]
    fn test_unaffiliated_serves_every_platform() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("any-1")]);

        assert_eq!(pool.acquire("stubhub", "search").unwrap().id(), "any-1");
        assert_eq!(pool.acquire("viagogo", "search").unwrap().id(), "any-1");
    }

    #[test]
    fn test_acquire_prefers_least_recently_used() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("a"), Identity::new("b")]);

        let first = pool.acquire("stubhub", "search").unwrap();
        let second = pool.acquire("stubhub", "search").unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_failure_cools_identity() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("a")]);

        let status = pool.release("a", ReleaseOutcome::Failure).unwrap();
        assert_eq!(status, IdentityStatus::Cooling);
        assert!(pool.acquire("stubhub", "search").is_err());

        clock.advance(Duration::seconds(31));
        assert!(pool.acquire("stubhub", "search").is_ok());
    }

    #[test]
    fn test_disable_after_threshold_then_reactivate_and_reset() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("a")]);
        let threshold = pool.config().disable_threshold;

        for _ in 0..threshold {
            pool.release("a", ReleaseOutcome::Failure).unwrap();
        }
        let identity = pool.get("a").unwrap();
        assert_eq!(identity.status, IdentityStatus::Disabled);
        assert_eq!(identity.consecutive_failures, threshold);

        // Not idle long enough yet
        clock.advance(Duration::minutes(30));
        assert_eq!(pool.reconcile(), 0);

        clock.advance(Duration::minutes(31));
        assert_eq!(pool.reconcile(), 1);
        assert_eq!(pool.get("a").unwrap().status, IdentityStatus::Active);

        pool.release("a", ReleaseOutcome::Success).unwrap();
        assert_eq!(pool.get("a").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_readmitted_identity_is_on_probation() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("a")]);
        for _ in 0..5 {
            pool.release("a", ReleaseOutcome::Failure).unwrap();
        }
        clock.advance(Duration::hours(2));
        pool.reconcile();

        let status = pool.release("a", ReleaseOutcome::Failure).unwrap();
        assert_eq!(status, IdentityStatus::Disabled);
    }

    #[test]
    fn test_release_unknown_identity() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![]);
        assert_eq!(
            pool.release("ghost", ReleaseOutcome::Success),
            Err(PoolError::UnknownIdentity("ghost".to_string()))
        );
    }

    #[test]
    fn test_expand_skips_duplicates() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("a")]);
        let added = pool.expand(vec![Identity::new("a"), Identity::new("b")]);
        assert_eq!(added, 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_reconcile_decays_recent_uses() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(&clock, vec![Identity::new("a")]);
        for _ in 0..4 {
            pool.acquire("stubhub", "search").unwrap();
        }
        assert_eq!(pool.get("a").unwrap().recent_uses_for("stubhub"), 4);

        pool.reconcile();
        assert_eq!(pool.get("a").unwrap().recent_uses_for("stubhub"), 2);
    }

    #[test]
    fn test_stats_counts_statuses() {
        let clock = ManualClock::starting_now();
        let pool = pool_with(
            &clock,
            vec![Identity::new("a"), Identity::new("b"), Identity::new("c")],
        );
        pool.release("b", ReleaseOutcome::Failure).unwrap();
        for _ in 0..5 {
            pool.release("c", ReleaseOutcome::Rejected).unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.cooling, 1);
        assert_eq!(stats.disabled, 1);
    }
}
