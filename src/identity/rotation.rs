//! Weighted identity rotation
//!
//! Wraps [`IdentityPool`] selection with randomization biased toward the
//! least used identities, so the request fingerprint distribution for a
//! platform flattens over time instead of hammering the first eligible
//! identity.

use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::pool::{Candidate, IdentityLease, IdentityPool};
use crate::clock::to_chrono;
use crate::utils::error::PoolError;

/// Checkout attempts before giving up when racing other selectors
const MAX_CHECKOUT_ATTEMPTS: usize = 3;

// ============================================================================
// Configuration
// ============================================================================

/// Rotation selector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Minimum time before the same identity serves the same platform again (seconds)
    pub min_spacing_secs: u64,

    /// Fixed RNG seed; random when absent
    pub seed: Option<u64>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            min_spacing_secs: 10,
            seed: None,
        }
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Cooldown-aware weighted selector over an identity pool
#[derive(Debug)]
pub struct RotationSelector {
    pool: Arc<IdentityPool>,
    config: RotationConfig,
    rng: Mutex<ChaCha8Rng>,
}

impl RotationSelector {
    /// Create a selector over the pool
    pub fn new(pool: Arc<IdentityPool>, config: RotationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            pool,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.pool
    }

    /// Selection weight for a candidate
    pub fn weight(candidate: &Candidate) -> f64 {
        1.0 / (1.0 + f64::from(candidate.recent_uses))
    }

    /// Select an identity for a platform/operation pair
    ///
    /// The chosen identity receives a spacing cooldown for the platform, so
    /// the same identity is never handed out twice for one platform inside
    /// `min_spacing_secs`. Returns `Exhausted` when nothing is eligible.
    pub fn select(&self, platform: &str, operation: &str) -> Result<IdentityLease, PoolError> {
        let spacing = to_chrono(std::time::Duration::from_secs(self.config.min_spacing_secs));

        for _ in 0..MAX_CHECKOUT_ATTEMPTS {
            let candidates = self.pool.candidates(platform);
            let Some(chosen) = self.pick(&candidates) else {
                break;
            };
            if let Some(lease) = self.pool.checkout(&chosen.id, platform, operation, spacing) {
                return Ok(lease);
            }
            tracing::debug!(
                identity = %chosen.id,
                platform = %platform,
                "Lost checkout race, retrying"
            );
        }

        Err(PoolError::Exhausted {
            platform: platform.to_string(),
        })
    }

    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        match candidates.len() {
            0 => None,
            1 => candidates.first(),
            _ => {
                let weights: Vec<f64> = candidates.iter().map(Self::weight).collect();
                let dist = WeightedIndex::new(&weights).ok()?;
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                candidates.get(dist.sample(&mut *rng))
            }
        }
    }
}
