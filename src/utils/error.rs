//! Error types for the orchestration engine components
//!
//! This module defines the per-component error enums. The crate-level
//! [`crate::error::Error`] wraps all of them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome classification reported by scraper plugins
///
/// `Exhausted` and `Denied` never come from a plugin; they are raised by the
/// identity pool and the admission governor respectively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrapeErrorKind {
    /// External call exceeded its time bound
    Timeout,

    /// Bot detection, HTTP 429 or 403 from the platform
    PlatformRejected {
        /// Signal reported by the plugin (e.g. "429", "cloudflare")
        signal: String,
    },

    /// Target no longer exists or the request is malformed
    PermanentFailure {
        /// Plugin-supplied reason
        reason: String,
    },

    /// Any other failure worth retrying (connection reset, 5xx)
    Transient {
        /// Plugin-supplied reason
        reason: String,
    },
}

impl ScrapeErrorKind {
    /// Shorthand for a rejection signal
    pub fn rejected(signal: impl Into<String>) -> Self {
        Self::PlatformRejected {
            signal: signal.into(),
        }
    }

    /// Shorthand for a permanent failure
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }

    /// Shorthand for a transient failure
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Whether the job should be requeued
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PermanentFailure { .. })
    }

    /// Whether the governor should tighten its refill rate
    pub fn escalates_backoff(&self) -> bool {
        matches!(self, Self::PlatformRejected { .. })
    }

    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::PlatformRejected { .. } => "platform_rejected",
            Self::PermanentFailure { .. } => "permanent_failure",
            Self::Transient { .. } => "transient",
        }
    }
}

impl fmt::Display for ScrapeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "operation timed out"),
            Self::PlatformRejected { signal } => write!(f, "rejected by platform ({signal})"),
            Self::PermanentFailure { reason } => write!(f, "permanent failure: {reason}"),
            Self::Transient { reason } => write!(f, "transient failure: {reason}"),
        }
    }
}

/// Errors raised by the identity pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No eligible identity right now; back off and retry
    #[error("No eligible identity for platform '{platform}'")]
    Exhausted { platform: String },

    /// Identity id not present in the pool
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// Provisioning collaborator failed
    #[error("Identity provider error: {0}")]
    Provider(String),
}

/// Errors raised by the admission governor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Admission refused; the job should be delayed, not failed
    #[error("Admission denied for '{platform}': {reason}")]
    Denied {
        platform: String,
        reason: DenyReason,
    },
}

/// Why the governor refused admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Token bucket empty
    NoTokens,
    /// Concurrency cap reached
    ConcurrencyLimit,
    /// Circuit breaker open
    CircuitOpen,
    /// Platform disabled by an operator
    PlatformDisabled,
}

impl DenyReason {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTokens => "no_tokens",
            Self::ConcurrencyLimit => "concurrency_limit",
            Self::CircuitOpen => "circuit_open",
            Self::PlatformDisabled => "platform_disabled",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by the result cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Layer not configured
    #[error("Unknown cache layer: {0}")]
    UnknownLayer(String),

    /// Warmup producer failed for one key
    #[error("Warmup producer for '{layer}/{key}' failed: {reason}")]
    ProducerFailed {
        layer: String,
        key: String,
        reason: String,
    },
}

/// Errors raised by the watchlist engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchlistError {
    /// Watch item id not registered
    #[error("Watch item not found: {0}")]
    NotFound(String),

    /// Criteria rejected at registration
    #[error("Invalid alert criteria: {0}")]
    InvalidCriteria(String),

    /// Payload could not be read as a listing snapshot
    #[error("Unreadable scrape payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised by the plugin registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// No plugin registered for the platform
    #[error("No scraper plugin registered for platform '{0}'")]
    NotRegistered(String),

    /// Plugin registered but switched off
    #[error("Scraper plugin for platform '{0}' is disabled")]
    Disabled(String),
}

/// Errors raised by snapshot persistence
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure
    #[error("Snapshot I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot content could not be (de)serialized
    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
