//! Integration tests for the standalone components
//!
//! Identity pool lifecycle, governor concurrency bounds and cache
//! expiry/invalidation, each driven through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ticketwatch::admission::{AdmissionConfig, AdmissionGovernor, PlatformLimits};
use ticketwatch::cache::{CacheConfig, CacheKey, InvalidationTarget, ResultCache};
use ticketwatch::clock::{ManualClock, SharedClock, SystemClock};
use ticketwatch::identity::{
    Identity, IdentityPool, IdentityStatus, PoolConfig, ReleaseOutcome,
};
use ticketwatch::utils::error::{AdmissionError, DenyReason, PoolError};

fn manual_clock() -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::starting_now());
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

// ============================================================================
// Identity Pool
// ============================================================================

#[test]
fn test_identity_disabled_then_readmitted_after_idle() {
    let (clock, shared) = manual_clock();
    let pool = IdentityPool::new(PoolConfig::default(), shared);
    pool.expand([Identity::new("id-1")]);

    let threshold = pool.config().disable_threshold;
    for i in 1..threshold {
        assert_eq!(
            pool.release("id-1", ReleaseOutcome::Failure).unwrap(),
            IdentityStatus::Cooling,
            "failure {i} only cools the identity down"
        );
    }
    assert_eq!(
        pool.release("id-1", ReleaseOutcome::Failure).unwrap(),
        IdentityStatus::Disabled
    );
    assert!(matches!(
        pool.acquire("stubhub", "listings"),
        Err(PoolError::Exhausted { .. })
    ));

    // Not idle long enough yet
    clock.advance(chrono::Duration::minutes(30));
    assert_eq!(pool.reconcile(), 0);

    clock.advance(chrono::Duration::minutes(31));
    assert_eq!(pool.reconcile(), 1);
    let identity = pool.get("id-1").unwrap();
    assert_eq!(identity.status, IdentityStatus::Active);
    assert_eq!(identity.consecutive_failures, threshold);

    let lease = pool.acquire("stubhub", "listings").unwrap();
    pool.release(lease.id(), ReleaseOutcome::Success).unwrap();
    assert_eq!(pool.get("id-1").unwrap().consecutive_failures, 0);
}

#[test]
fn test_readmitted_identity_disabled_on_next_failure() {
    let (clock, shared) = manual_clock();
    let pool = IdentityPool::new(PoolConfig::default(), shared);
    pool.expand([Identity::new("id-1"), Identity::new("id-2")]);

    for _ in 0..pool.config().disable_threshold {
        pool.release("id-1", ReleaseOutcome::Rejected).unwrap();
    }
    clock.advance(chrono::Duration::hours(2));
    pool.reconcile();

    assert_eq!(
        pool.release("id-1", ReleaseOutcome::Failure).unwrap(),
        IdentityStatus::Disabled
    );
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.disabled, 1);
}

#[test]
fn test_cooling_identity_returns_after_cooldown() {
    let (clock, shared) = manual_clock();
    let config = PoolConfig::default();
    let cooldown = config.cooldown_for(1, false);
    let pool = IdentityPool::new(config, shared);
    pool.expand([Identity::new("id-1")]);

    pool.release("id-1", ReleaseOutcome::Failure).unwrap();
    assert!(pool.acquire("stubhub", "listings").is_err());

    clock.advance(cooldown + chrono::Duration::seconds(1));
    assert!(pool.acquire("stubhub", "listings").is_ok());
}

// ============================================================================
// Admission Governor
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_never_exceeds_max_concurrency() {
    let max_concurrency = 3;
    let config = AdmissionConfig {
        default: PlatformLimits {
            rate_per_sec: 10_000.0,
            burst: 10_000,
            max_concurrency,
        },
        ..AdmissionConfig::default()
    };
    let governor = Arc::new(AdmissionGovernor::new(config, SystemClock::shared()));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let admitted = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let governor = Arc::clone(&governor);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let admitted = Arc::clone(&admitted);
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                match governor.try_admit("stubhub") {
                    Ok(token) => {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        admitted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        governor.release(token, ReleaseOutcome::Success);
                    }
                    Err(AdmissionError::Denied { reason, .. }) => {
                        assert_eq!(reason, DenyReason::ConcurrencyLimit);
                        tokio::task::yield_now().await;
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= max_concurrency);
    assert!(admitted.load(Ordering::SeqCst) > 0);
    assert_eq!(governor.snapshot("stubhub").in_flight, 0);
}

#[test]
fn test_disabled_platform_denied() {
    let governor = AdmissionGovernor::new(AdmissionConfig::default(), SystemClock::shared());
    governor.set_enabled("stubhub", false);
    let err = governor.try_admit("stubhub").unwrap_err();
    assert!(matches!(
        err,
        AdmissionError::Denied {
            reason: DenyReason::PlatformDisabled,
            ..
        }
    ));

    governor.set_enabled("stubhub", true);
    assert!(governor.try_admit("stubhub").is_ok());
}

// ============================================================================
// Result Cache
// ============================================================================

#[test]
fn test_entry_expires_after_layer_ttl() {
    let (clock, shared) = manual_clock();
    let cache = ResultCache::new(&CacheConfig::default(), shared);
    let key = CacheKey::new("stubhub", "event-1", "monitoring");

    cache
        .put(&key, serde_json::json!({ "listing_count": 4 }), None, Vec::<String>::new())
        .unwrap();
    clock.advance(chrono::Duration::seconds(299));
    assert!(cache.get(&key).is_some());

    clock.advance(chrono::Duration::seconds(2));
    assert!(cache.get(&key).is_none());
}

#[test]
fn test_explicit_ttl_overrides_layer() {
    let (clock, shared) = manual_clock();
    let cache = ResultCache::new(&CacheConfig::default(), shared);
    let key = CacheKey::new("stubhub", "event-1", "system");

    cache
        .put(&key, serde_json::json!(1), Some(Duration::from_secs(10)), ["pinned"])
        .unwrap();
    clock.advance(chrono::Duration::seconds(11));
    assert!(cache.get(&key).is_none());
    assert_eq!(cache.purge_expired(), 0);
}

#[test]
fn test_tag_cascade_follows_dependency_tags() {
    let (_, shared) = manual_clock();
    let cache = ResultCache::new(&CacheConfig::default(), shared);
    let a = CacheKey::new("stubhub", "event-1", "tickets");
    let b = CacheKey::new("stubhub", "venue-9", "analytics");
    let c = CacheKey::new("stubhub", "event-2", "analytics");

    cache.put(&a, serde_json::json!("a"), None, ["event:1", "venue:9"]).unwrap();
    cache.put(&b, serde_json::json!("b"), None, ["venue:9"]).unwrap();
    cache.put(&c, serde_json::json!("c"), None, ["event:2"]).unwrap();

    let report = cache.invalidate(&InvalidationTarget::Tag("event:1".to_string()), true);
    assert_eq!(report.get("tickets"), Some(&1));
    assert_eq!(report.get("analytics"), Some(&1));

    assert!(cache.get(&a).is_none());
    assert!(cache.get(&b).is_none());
    assert!(cache.get(&c).is_some());
}

#[test]
fn test_tag_invalidation_without_cascade() {
    let (_, shared) = manual_clock();
    let cache = ResultCache::new(&CacheConfig::default(), shared);
    let a = CacheKey::new("stubhub", "event-1", "tickets");
    let b = CacheKey::new("stubhub", "venue-9", "analytics");

    cache.put(&a, serde_json::json!("a"), None, ["event:1", "venue:9"]).unwrap();
    cache.put(&b, serde_json::json!("b"), None, ["venue:9"]).unwrap();

    cache.invalidate(&InvalidationTarget::Tag("event:1".to_string()), false);
    assert!(cache.get(&a).is_none());
    assert!(cache.get(&b).is_some());
}

#[test]
fn test_layer_cascade_clears_dependents() {
    let (_, shared) = manual_clock();
    let cache = ResultCache::new(&CacheConfig::default(), shared);
    let ticket = CacheKey::new("stubhub", "event-1", "tickets");
    let event = CacheKey::new("stubhub", "event-1", "events");
    let system = CacheKey::new("stubhub", "config", "system");

    for key in [&ticket, &event, &system] {
        cache.put(key, serde_json::json!(true), None, Vec::<String>::new()).unwrap();
    }

    cache.invalidate(&InvalidationTarget::Layer("tickets".to_string()), true);
    assert!(cache.get(&ticket).is_none());
    assert!(cache.get(&event).is_none());
    assert!(cache.get(&system).is_some());
}
