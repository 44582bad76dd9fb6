//! Priority scheduling of scrape jobs
//!
//! The scheduler owns every queued job, orders it per platform and hands
//! ready work to the platform's workers. Retry/backoff, coalescing and
//! cancellation all happen here; the workers only execute.
//!
//! # Architecture
//!
//! ```text
//!  enqueue ──► ┌────────────────────────┐   pop_ready   ┌──────────────┐
//!              │ Scheduler              │ ────────────► │ worker pool  │
//!              │  platform → queue      │               │ (per platform)│
//!              │  job id   → platform   │ ◄──────────── │              │
//!              └────────────────────────┘ complete/fail └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`job`] - Job model, priority classes and scoring
//! - [`queue`] - Per-platform priority queue
//! - [`worker`] - Worker loops executing jobs against the plugins
//! - [`error`] - Scheduler error type
//!
//! # Ordering
//!
//! Within one platform a higher score always dispatches before a lower one
//! when both are ready; equal scores dispatch FIFO. There is no ordering
//! across platforms.

pub mod error;
pub mod job;
pub mod queue;
pub mod worker;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub use error::{SchedulerError, SchedulerResult};
pub use job::{CancelFlag, JobKey, JobRequest, JobState, Priority, ScrapeJob};
pub use queue::PlatformQueue;
pub use worker::{DispatchContext, DispatchOutcome, WorkerPool};

use crate::clock::{to_chrono, SharedClock};
use crate::metrics;
use crate::utils::retry::RetryConfig;

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workers per platform
    pub workers_per_platform: usize,

    /// Maximum queued jobs per platform
    pub queue_capacity: usize,

    /// Attempts before a job is marked failed
    pub max_attempts: u32,

    /// Retry backoff base (milliseconds)
    pub base_delay_ms: u64,

    /// Retry backoff cap (milliseconds)
    pub max_delay_ms: u64,

    /// Requeue delay after a denied admission or exhausted pool (milliseconds)
    pub backpressure_delay_ms: u64,

    /// Bound on one external scrape call (seconds)
    pub operation_timeout_secs: u64,

    /// Refresh interval for watched items (seconds)
    pub monitoring_interval_secs: u64,

    /// Worker sleep when its queue has nothing ready (milliseconds)
    pub idle_poll_ms: u64,

    /// Finished jobs kept for the dashboard
    pub recent_jobs_limit: usize,

    /// Platforms that get workers at start
    pub platforms: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers_per_platform: 2,
            queue_capacity: 10_000,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backpressure_delay_ms: 500,
            operation_timeout_secs: 30,
            monitoring_interval_secs: 300,
            idle_poll_ms: 250,
            recent_jobs_limit: 200,
            platforms: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Backoff policy for failed jobs
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.max_attempts.saturating_sub(1),
            self.base_delay_ms,
            self.max_delay_ms,
        )
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.workers_per_platform == 0 {
            return Err("scheduler.workers_per_platform must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("scheduler.queue_capacity must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("scheduler.max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("scheduler.base_delay_ms must not exceed max_delay_ms".to_string());
        }
        if self.monitoring_interval_secs == 0 {
            return Err("scheduler.monitoring_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: String,
    /// True when an existing job was reused
    pub coalesced: bool,
}

/// Result of a cancel call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Job removed from the queue
    Removed,
    /// Job is executing; it will finish without committing results
    Flagged,
}

/// What happened to a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued with backoff
    Retrying { attempt: u32, delay_ms: u64 },
    /// Attempts exhausted or failure not retryable
    Failed,
}

/// Terminal job summary kept for the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub platform: String,
    pub operation: String,
    pub target: String,
    pub state: JobState,
    pub attempts: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Per-platform counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub enqueued: u64,
    pub coalesced: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

/// Queue view for one platform
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub platform: String,
    pub depth: usize,
    pub in_flight: usize,
    pub counters: JobCounters,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Priority scheduler over per-platform queues
#[derive(Debug)]
pub struct Scheduler {
    queues: DashMap<String, Arc<Mutex<PlatformQueue>>>,
    notifiers: DashMap<String, Arc<Notify>>,
    index: DashMap<String, String>,
    counters: DashMap<String, JobCounters>,
    recent: Mutex<VecDeque<JobRecord>>,
    seq: AtomicU64,
    config: SchedulerConfig,
    retry: RetryConfig,
    clock: SharedClock,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig, clock: SharedClock) -> Self {
        Self {
            queues: DashMap::new(),
            notifiers: DashMap::new(),
            index: DashMap::new(),
            counters: DashMap::new(),
            recent: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            retry: config.retry_config(),
            config,
            clock,
        }
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Clock used for `ready_at` and scoring
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn queue(&self, platform: &str) -> Arc<Mutex<PlatformQueue>> {
        self.queues
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PlatformQueue::new(self.config.queue_capacity))))
            .clone()
    }

    fn existing_queue(&self, platform: &str) -> Option<Arc<Mutex<PlatformQueue>>> {
        self.queues.get(platform).map(|q| Arc::clone(q.value()))
    }

    /// Wake-up handle for a platform's workers
    pub fn notifier(&self, platform: &str) -> Arc<Notify> {
        self.notifiers
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn count(&self, platform: &str, update: impl FnOnce(&mut JobCounters)) {
        update(&mut self.counters.entry(platform.to_string()).or_default());
    }

    /// Schedule a job, coalescing with a queued or running job for the same target
    pub fn enqueue(&self, request: JobRequest) -> SchedulerResult<EnqueueOutcome> {
        request.validate().map_err(SchedulerError::invalid_job)?;

        let now = self.clock.now();
        let platform = request.platform.clone();
        let queue = self.queue(&platform);
        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = queue.find_by_key(&request.key()) {
            let job_id = existing.id.clone();
            let score = request.score(now);
            if queue.raise_score(&job_id, score) {
                tracing::debug!(
                    job_id = %job_id,
                    platform = %platform,
                    score,
                    "Coalesced job priority raised"
                );
            }
            drop(queue);
            self.count(&platform, |c| c.coalesced += 1);
            return Ok(EnqueueOutcome {
                job_id,
                coalesced: true,
            });
        }

        if !queue.has_capacity() {
            return Err(SchedulerError::queue_full(
                platform,
                self.config.queue_capacity,
            ));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let job = ScrapeJob::from_request(request, self.config.max_attempts, now, seq);
        let job_id = job.id.clone();
        tracing::debug!(
            job_id = %job_id,
            platform = %platform,
            operation = %job.operation,
            target = %job.target,
            score = job.score,
            "Job enqueued"
        );
        queue.push(job);
        let depth = queue.depth();
        drop(queue);

        self.index.insert(job_id.clone(), platform.clone());
        self.count(&platform, |c| c.enqueued += 1);
        metrics::record_job_enqueued(&platform);
        metrics::set_queue_depth(&platform, depth);
        self.notifier(&platform).notify_one();

        Ok(EnqueueOutcome {
            job_id,
            coalesced: false,
        })
    }

    /// Take the best ready job for a platform, marking it running
    pub fn pop_ready(&self, platform: &str) -> Option<ScrapeJob> {
        let queue = self.existing_queue(platform)?;
        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        let job = queue.pop_ready(self.clock.now());
        metrics::set_queue_depth(platform, queue.depth());
        job
    }

    /// Earliest time a queued job of the platform becomes ready
    pub fn next_ready_at(&self, platform: &str) -> Option<DateTime<Utc>> {
        let queue = self.existing_queue(platform)?;
        let queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.next_ready_at()
    }

    /// Whether a queued job of the platform is ready now
    pub fn has_ready(&self, platform: &str) -> bool {
        self.next_ready_at(platform)
            .is_some_and(|at| at <= self.clock.now())
    }

    /// Return a running job to the queue untouched
    ///
    /// The job keeps its ready time and submission order and no attempt is
    /// counted.
    pub fn defer(&self, job: &ScrapeJob) {
        if let Some(queue) = self.existing_queue(&job.platform) {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.requeue(&job.id, job.ready_at);
            metrics::set_queue_depth(&job.platform, queue.depth());
        }
    }

    /// Mark a running job completed
    pub fn complete(&self, job: &ScrapeJob) {
        self.finish(job, JobState::Completed, None);
    }

    /// Mark a running job cancelled (it was flagged while in flight)
    pub fn acknowledge_cancel(&self, job: &ScrapeJob) {
        self.finish(job, JobState::Cancelled, None);
    }

    /// Record a failed attempt, requeueing with backoff while attempts remain
    pub fn fail(&self, job: &ScrapeJob, error: &str, retryable: bool) -> FailureDisposition {
        let Some(queue) = self.existing_queue(&job.platform) else {
            return FailureDisposition::Failed;
        };
        let mut guard = queue.lock().unwrap_or_else(|e| e.into_inner());

        let attempts = match guard.get_mut(&job.id) {
            Some(stored) => {
                stored.attempts += 1;
                stored.last_error = Some(error.to_string());
                stored.attempts
            }
            None => return FailureDisposition::Failed,
        };

        if retryable && attempts < job.max_attempts && !job.is_cancelled() {
            let delay = self.retry.backoff_delay(attempts);
            let ready_at = self.clock.now() + to_chrono(delay);
            guard.requeue(&job.id, ready_at);
            metrics::set_queue_depth(&job.platform, guard.depth());
            drop(guard);

            self.count(&job.platform, |c| c.retried += 1);
            tracing::warn!(
                job_id = %job.id,
                platform = %job.platform,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, retrying with backoff"
            );
            return FailureDisposition::Retrying {
                attempt: attempts,
                delay_ms: delay.as_millis() as u64,
            };
        }
        drop(guard);

        let state = if job.is_cancelled() {
            JobState::Cancelled
        } else {
            JobState::Failed
        };
        self.finish(job, state, Some(error.to_string()));
        FailureDisposition::Failed
    }

    fn finish(&self, job: &ScrapeJob, state: JobState, error: Option<String>) {
        let finished = self.existing_queue(&job.platform).and_then(|queue| {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            let finished = queue.finish(&job.id, state);
            metrics::set_queue_depth(&job.platform, queue.depth());
            finished
        });
        self.index.remove(&job.id);

        let attempts = finished.as_ref().map_or(job.attempts, |j| j.attempts);
        match state {
            JobState::Completed => self.count(&job.platform, |c| c.completed += 1),
            JobState::Failed => {
                self.count(&job.platform, |c| c.failed += 1);
                tracing::error!(
                    job_id = %job.id,
                    platform = %job.platform,
                    attempts,
                    error = error.as_deref().unwrap_or("unknown"),
                    "Job failed permanently"
                );
            }
            JobState::Cancelled => self.count(&job.platform, |c| c.cancelled += 1),
            JobState::Queued | JobState::Running => {}
        }
        metrics::record_job_finished(&job.platform, state.as_str());

        self.record(JobRecord {
            id: job.id.clone(),
            platform: job.platform.clone(),
            operation: job.operation.clone(),
            target: job.target.clone(),
            state,
            attempts,
            error,
            finished_at: self.clock.now(),
        });
    }

    fn record(&self, record: JobRecord) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_back(record);
        while recent.len() > self.config.recent_jobs_limit {
            recent.pop_front();
        }
    }

    /// Cancel a queued or running job
    pub fn cancel(&self, job_id: &str) -> SchedulerResult<CancelOutcome> {
        let platform = self
            .index
            .get(job_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
        let queue = self
            .existing_queue(&platform)
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
        let mut guard = queue.lock().unwrap_or_else(|e| e.into_inner());

        let job = guard
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;

        match job.state {
            JobState::Queued => {
                guard.finish(job_id, JobState::Cancelled);
                metrics::set_queue_depth(&platform, guard.depth());
                drop(guard);
                self.index.remove(job_id);
                self.count(&platform, |c| c.cancelled += 1);
                metrics::record_job_finished(&platform, JobState::Cancelled.as_str());
                self.record(JobRecord {
                    id: job.id.clone(),
                    platform: platform.clone(),
                    operation: job.operation.clone(),
                    target: job.target.clone(),
                    state: JobState::Cancelled,
                    attempts: job.attempts,
                    error: None,
                    finished_at: self.clock.now(),
                });
                tracing::info!(job_id = %job_id, platform = %platform, "Queued job cancelled");
                Ok(CancelOutcome::Removed)
            }
            JobState::Running => {
                job.cancel.cancel();
                tracing::info!(
                    job_id = %job_id,
                    platform = %platform,
                    "In-flight job flagged for cancellation"
                );
                Ok(CancelOutcome::Flagged)
            }
            state => Err(SchedulerError::AlreadyTerminal {
                job_id: job_id.to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Current view of a live job
    pub fn job(&self, job_id: &str) -> Option<ScrapeJob> {
        let platform = self.index.get(job_id)?.value().clone();
        let queue = self.existing_queue(&platform)?;
        let queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.get(job_id).cloned()
    }

    /// Queued jobs for a platform, best first
    pub fn queued_jobs(&self, platform: &str) -> Vec<ScrapeJob> {
        let Some(queue) = self.existing_queue(platform) else {
            return Vec::new();
        };
        let queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        queue
            .jobs()
            .into_iter()
            .filter(|job| job.state == JobState::Queued)
            .cloned()
            .collect()
    }

    /// Queue depth for one platform
    pub fn depth(&self, platform: &str) -> usize {
        self.existing_queue(platform).map_or(0, |queue| {
            queue.lock().unwrap_or_else(|e| e.into_inner()).depth()
        })
    }

    /// Platforms with a queue
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        platforms.sort();
        platforms
    }

    /// Queue views for every platform
    pub fn snapshots(&self) -> BTreeMap<String, QueueSnapshot> {
        self.platforms()
            .into_iter()
            .filter_map(|platform| {
                let queue = self.existing_queue(&platform)?;
                let (depth, in_flight) = {
                    let queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                    (queue.depth(), queue.in_flight())
                };
                let counters = self
                    .counters
                    .get(&platform)
                    .map(|c| *c.value())
                    .unwrap_or_default();
                Some((
                    platform.clone(),
                    QueueSnapshot {
                        platform,
                        depth,
                        in_flight,
                        counters,
                    },
                ))
            })
            .collect()
    }

    /// Most recent terminal jobs, newest first
    pub fn recent_jobs(&self, limit: usize) -> Vec<JobRecord> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Time until the platform has ready work, capped by `max`
    pub fn idle_wait(&self, platform: &str, max: std::time::Duration) -> std::time::Duration {
        match self.next_ready_at(platform) {
            Some(at) => {
                let wait = at - self.clock.now();
                if wait <= Duration::zero() {
                    std::time::Duration::ZERO
                } else {
                    wait.to_std().map_or(max, |w| w.min(max))
                }
            }
            None => max,
        }
    }
}
