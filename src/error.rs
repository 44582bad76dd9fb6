//! Unified error handling for the ticketwatch crate
//!
//! This module provides a unified error type that consolidates all
//! component errors into a single `Error` enum, while keeping the
//! component errors available when a caller needs the detail.
//!
//! # Architecture
//!
//! - [`EngineErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all component errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use ticketwatch::error::{Error, EngineErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(error = %err, "Retrying later");
//!     } else {
//!         tracing::error!(error = %err, "Giving up");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export component errors for convenience
pub use crate::scheduler::error::SchedulerError;
pub use crate::utils::error::{
    AdmissionError, CacheError, DenyReason, PluginError, PoolError, ScrapeErrorKind,
    StorageError, WatchlistError,
};

/// Common trait for all ticketwatch error types
pub trait EngineErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backpressure signals (exhausted identities, denied admission)
    Backpressure,
    /// Scheduling and queue errors
    Scheduler,
    /// Cache errors
    Cache,
    /// Watchlist and alerting errors
    Watchlist,
    /// Plugin lookup and execution errors
    Plugin,
    /// Storage and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backpressure => "backpressure",
            Self::Scheduler => "scheduler",
            Self::Cache => "cache",
            Self::Watchlist => "watchlist",
            Self::Plugin => "plugin",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the ticketwatch crate
#[derive(Error, Debug)]
pub enum Error {
    /// Identity pool errors
    #[error("Identity pool error: {0}")]
    Pool(#[from] PoolError),

    /// Admission governor errors
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Watchlist errors
    #[error("Watchlist error: {0}")]
    Watchlist(#[from] WatchlistError),

    /// Plugin registry errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Snapshot persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EngineErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Pool(e) => matches!(e, PoolError::Exhausted { .. }),
            Self::Admission(_) => true,
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Cache(_) => true, // caching is advisory
            Self::Watchlist(_) => false,
            Self::Plugin(e) => matches!(e, PluginError::Disabled(_)),
            Self::Storage(_) => true,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Pool(PoolError::Exhausted { .. }) | Self::Admission(_) => {
                ErrorCategory::Backpressure
            }
            Self::Pool(_) => ErrorCategory::Other,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Cache(_) => ErrorCategory::Cache,
            Self::Watchlist(_) => ErrorCategory::Watchlist,
            Self::Plugin(_) => ErrorCategory::Plugin,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
