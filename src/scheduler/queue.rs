//! Per-platform priority queue
//!
//! Jobs live in a max-heap ordered by score, then by enqueue sequence
//! (FIFO). Jobs waiting out a retry backoff stay in the heap and are
//! passed over until their `ready_at`. Heap entries are never removed
//! eagerly: each carries the job's epoch and is skipped on pop if the job
//! was cancelled, re-scored or re-inserted since.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::job::{JobKey, JobState, ScrapeJob};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    score: i64,
    seq: u64,
    epoch: u64,
    id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue holding every non-terminal job of one platform
#[derive(Debug)]
pub struct PlatformQueue {
    capacity: usize,
    ready: BinaryHeap<ReadyEntry>,
    jobs: HashMap<String, ScrapeJob>,
    keys: HashMap<JobKey, String>,
    queued: usize,
}

impl PlatformQueue {
    /// Create an empty queue
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ready: BinaryHeap::new(),
            jobs: HashMap::new(),
            keys: HashMap::new(),
            queued: 0,
        }
    }

    /// Jobs waiting to be dispatched
    pub fn depth(&self) -> usize {
        self.queued
    }

    /// Jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .count()
    }

    /// Whether another job fits
    pub fn has_capacity(&self) -> bool {
        self.queued < self.capacity
    }

    /// Queued or running job with the same key
    pub fn find_by_key(&self, key: &JobKey) -> Option<&ScrapeJob> {
        self.keys.get(key).and_then(|id| self.jobs.get(id))
    }

    /// Look up a job
    pub fn get(&self, id: &str) -> Option<&ScrapeJob> {
        self.jobs.get(id)
    }

    /// Insert a new queued job; capacity is checked by the caller
    pub fn push(&mut self, mut job: ScrapeJob) {
        job.state = JobState::Queued;
        self.keys.insert(job.key(), job.id.clone());
        self.queued += 1;
        self.schedule(&mut job);
        self.jobs.insert(job.id.clone(), job);
    }

    fn schedule(&mut self, job: &mut ScrapeJob) {
        job.epoch += 1;
        self.ready.push(ReadyEntry {
            score: job.score,
            seq: job.seq,
            epoch: job.epoch,
            id: job.id.clone(),
        });
    }

    /// Raise a queued job's score; returns whether it changed
    pub fn raise_score(&mut self, id: &str, score: i64) -> bool {
        let Some(mut job) = self.jobs.remove(id) else {
            return false;
        };
        let raised = job.state == JobState::Queued && score > job.score;
        if raised {
            job.score = score;
            self.schedule(&mut job);
        }
        self.jobs.insert(job.id.clone(), job);
        raised
    }

    /// Pop the best ready job and mark it running
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<ScrapeJob> {
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = self.ready.pop() {
            let Some(job) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if job.epoch != entry.epoch || job.state != JobState::Queued {
                continue;
            }
            if job.ready_at > now {
                deferred.push(entry);
                continue;
            }
            job.state = JobState::Running;
            self.queued -= 1;
            found = Some(job.clone());
            break;
        }

        self.ready.extend(deferred);
        found
    }

    /// Earliest instant a waiting job becomes ready
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .map(|job| job.ready_at)
            .min()
    }

    /// Put a running job back in the queue, not before `ready_at`
    pub fn requeue(&mut self, id: &str, ready_at: DateTime<Utc>) -> bool {
        let Some(mut job) = self.jobs.remove(id) else {
            return false;
        };
        if job.state != JobState::Running {
            self.jobs.insert(job.id.clone(), job);
            return false;
        }
        job.state = JobState::Queued;
        job.ready_at = ready_at;
        self.queued += 1;
        self.schedule(&mut job);
        self.jobs.insert(job.id.clone(), job);
        true
    }

    /// Mutable access to a job
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ScrapeJob> {
        self.jobs.get_mut(id)
    }

    /// Remove a job, setting its terminal state
    pub fn finish(&mut self, id: &str, state: JobState) -> Option<ScrapeJob> {
        let mut job = self.jobs.remove(id)?;
        if job.state == JobState::Queued {
            self.queued -= 1;
        }
        if self.keys.get(&job.key()) == Some(&job.id) {
            self.keys.remove(&job.key());
        }
        job.state = state;
        Some(job)
    }

    /// Non-terminal jobs, best first
    pub fn jobs(&self) -> Vec<&ScrapeJob> {
        let mut jobs: Vec<&ScrapeJob> = self.jobs.values().collect();
        jobs.sort_by(|a, b| b.score.cmp(&a.score).then(a.seq.cmp(&b.seq)));
        jobs
    }
}
