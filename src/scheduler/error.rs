//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Platform queue reached its capacity
    QueueFull {
        platform: String,
        capacity: usize,
    },

    /// Job id not known to the scheduler
    JobNotFound {
        job_id: String,
    },

    /// Job already reached a terminal state
    AlreadyTerminal {
        job_id: String,
        state: String,
    },

    /// Job description rejected at enqueue time
    InvalidJob {
        reason: String,
    },

    /// Dispatch loops are not running
    NotRunning,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { platform, capacity } => {
                write!(
                    f,
                    "Queue for platform '{}' is full (capacity {})",
                    platform, capacity
                )
            }
            Self::JobNotFound { job_id } => {
                write!(f, "Job not found: {}", job_id)
            }
            Self::AlreadyTerminal { job_id, state } => {
                write!(f, "Job {} is already {}", job_id, state)
            }
            Self::InvalidJob { reason } => {
                write!(f, "Invalid job: {}", reason)
            }
            Self::NotRunning => {
                write!(f, "Scheduler dispatch loops are not running")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create a queue full error
    pub fn queue_full(platform: impl Into<String>, capacity: usize) -> Self {
        Self::QueueFull {
            platform: platform.into(),
            capacity,
        }
    }

    /// Create a job not found error
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Create an invalid job error
    pub fn invalid_job(reason: impl Into<String>) -> Self {
        Self::InvalidJob {
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_error() {
        let err = SchedulerError::queue_full("viagogo", 10);
        assert!(err.to_string().contains("viagogo"));
        assert!(err.to_string().contains("10"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_job_not_recoverable() {
        let err = SchedulerError::invalid_job("empty platform");
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("empty platform"));
    }
}
