//! Scrape job model and priority scoring

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Priority
// ============================================================================

/// Explicit priority class of a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background refresh
    Low = 1,
    /// Standard monitoring
    #[default]
    Normal = 2,
    /// User-facing or time-sensitive
    High = 3,
    /// Always first
    Critical = 4,
}

impl Priority {
    /// Base score contributed by the class
    pub fn base_score(&self) -> i64 {
        match self {
            Self::Low => 10,
            Self::Normal => 20,
            Self::High => 40,
            Self::Critical => 60,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bonus for jobs whose event happens soon
pub fn proximity_bonus(event_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    let Some(date) = event_date else {
        return 0;
    };
    let until = date - now;
    if until < Duration::zero() {
        0
    } else if until <= Duration::hours(24) {
        30
    } else if until <= Duration::hours(72) {
        15
    } else if until <= Duration::days(7) {
        5
    } else {
        0
    }
}

/// Bonus for targets whose watch item alerted recently
pub fn trigger_bonus(last_triggered: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match last_triggered {
        Some(at) if now - at <= Duration::hours(1) => 20,
        _ => 0,
    }
}

/// Bonus for explicitly high-demand events
pub const HIGH_DEMAND_BONUS: i64 = 40;

// ============================================================================
// Job Request
// ============================================================================

/// Coalescing identity of a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub platform: String,
    pub entity: String,
    pub operation: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.platform, self.operation, self.entity)
    }
}

/// Caller-supplied description of work to schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Target platform
    pub platform: String,

    /// Operation kind understood by the platform plugin (e.g. "event_listings")
    pub operation: String,

    /// Target entity reference (event id, listing URL)
    pub target: String,

    /// Explicit priority class
    #[serde(default)]
    pub priority: Priority,

    /// High-demand flag
    #[serde(default)]
    pub high_demand: bool,

    /// Date of the underlying event
    #[serde(default)]
    pub event_date: Option<DateTime<Utc>>,

    /// Last alert time of the watch item for this target
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,

    /// Override for the configured attempt limit
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    /// Create a normal-priority request
    pub fn new(
        platform: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            operation: operation.into(),
            target: target.into(),
            priority: Priority::Normal,
            high_demand: false,
            event_date: None,
            last_triggered_at: None,
            max_attempts: None,
        }
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as high demand
    pub fn high_demand(mut self) -> Self {
        self.high_demand = true;
        self
    }

    /// Set the event date
    pub fn with_event_date(mut self, date: DateTime<Utc>) -> Self {
        self.event_date = Some(date);
        self
    }

    /// Set the last trigger time of the related watch item
    pub fn with_last_triggered(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_triggered_at = at;
        self
    }

    /// Override the attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Coalescing key
    pub fn key(&self) -> JobKey {
        JobKey {
            platform: self.platform.clone(),
            entity: self.target.clone(),
            operation: self.operation.clone(),
        }
    }

    /// Dispatch score at the given time; higher runs first
    pub fn score(&self, now: DateTime<Utc>) -> i64 {
        let mut score = self.priority.base_score()
            + proximity_bonus(self.event_date, now)
            + trigger_bonus(self.last_triggered_at, now);
        if self.high_demand {
            score += HIGH_DEMAND_BONUS;
        }
        score
    }

    /// Reject requests that can never run
    pub fn validate(&self) -> Result<(), String> {
        if self.platform.trim().is_empty() {
            return Err("platform must not be empty".to_string());
        }
        if self.operation.trim().is_empty() {
            return Err("operation must not be empty".to_string());
        }
        if self.target.trim().is_empty() {
            return Err("target must not be empty".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Job
// ============================================================================

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared cancellation flag for in-flight jobs
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A unit of scheduled work
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeJob {
    pub id: String,
    pub platform: String,
    pub operation: String,
    pub target: String,
    pub priority: Priority,
    pub high_demand: bool,
    pub event_date: Option<DateTime<Utc>>,
    /// Dispatch score, higher first
    pub score: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Not dispatched before this instant (retry backoff)
    pub ready_at: DateTime<Utc>,
    /// Completed execution attempts
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub last_error: Option<String>,
    /// FIFO tie-breaker
    #[serde(skip)]
    pub(crate) seq: u64,
    /// Bumped whenever the job is (re)inserted into a heap
    #[serde(skip)]
    pub(crate) epoch: u64,
    #[serde(skip)]
    pub(crate) cancel: CancelFlag,
}

impl ScrapeJob {
    pub(crate) fn from_request(
        request: JobRequest,
        default_max_attempts: u32,
        now: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        let score = request.score(now);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts),
            platform: request.platform,
            operation: request.operation,
            target: request.target,
            priority: request.priority,
            high_demand: request.high_demand,
            event_date: request.event_date,
            score,
            enqueued_at: now,
            ready_at: now,
            attempts: 0,
            state: JobState::Queued,
            last_error: None,
            seq,
            epoch: 0,
            cancel: CancelFlag::default(),
        }
    }

    /// Coalescing key
    pub fn key(&self) -> JobKey {
        JobKey {
            platform: self.platform.clone(),
            entity: self.target.clone(),
            operation: self.operation.clone(),
        }
    }

    /// Whether cancellation was requested while in flight
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
