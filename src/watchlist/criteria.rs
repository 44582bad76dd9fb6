//! Alert criteria and listing snapshot comparison

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::error::WatchlistError;

/// Thresholds that turn a snapshot change into an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertCriteria {
    /// Minimum absolute change of the lowest price, in percent
    pub price_delta_pct: Option<f64>,

    /// Alert when listings go from unavailable to available
    pub availability_flip: bool,

    /// Minimum increase in listing count
    pub new_listing_count: Option<u32>,
}

impl Default for AlertCriteria {
    fn default() -> Self {
        Self {
            price_delta_pct: Some(10.0),
            availability_flip: true,
            new_listing_count: Some(1),
        }
    }
}

impl AlertCriteria {
    /// Validate thresholds
    pub fn validate(&self) -> Result<(), WatchlistError> {
        if let Some(pct) = self.price_delta_pct {
            if !pct.is_finite() || pct <= 0.0 {
                return Err(WatchlistError::InvalidCriteria(format!(
                    "price_delta_pct must be a positive percentage, got {pct}"
                )));
            }
        }
        if self.new_listing_count == Some(0) {
            return Err(WatchlistError::InvalidCriteria(
                "new_listing_count must be at least 1".to_string(),
            ));
        }
        if self.price_delta_pct.is_none()
            && !self.availability_flip
            && self.new_listing_count.is_none()
        {
            return Err(WatchlistError::InvalidCriteria(
                "at least one criterion must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Changes between two snapshots that satisfy these criteria
    pub fn evaluate(
        &self,
        previous: &ListingSnapshot,
        current: &ListingSnapshot,
    ) -> Vec<AlertKind> {
        let mut kinds = Vec::new();

        if self.availability_flip && !previous.available && current.available {
            kinds.push(AlertKind::AvailabilityFlip);
        }

        if let (Some(threshold), Some(from), Some(to)) =
            (self.price_delta_pct, previous.min_price, current.min_price)
        {
            if from > 0.0 {
                let pct = (to - from) / from * 100.0;
                if pct.abs() >= threshold {
                    kinds.push(AlertKind::PriceDelta { from, to, pct });
                }
            }
        }

        if let Some(threshold) = self.new_listing_count {
            let added = current.listing_count.saturating_sub(previous.listing_count);
            if added >= threshold {
                kinds.push(AlertKind::NewListings {
                    from: previous.listing_count,
                    to: current.listing_count,
                });
            }
        }

        kinds
    }
}

/// Listing state of a watched entity at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub min_price: Option<f64>,
    pub available: bool,
    pub listing_count: u32,
    pub observed_at: DateTime<Utc>,
}

impl ListingSnapshot {
    /// Read a snapshot from a scrape payload
    ///
    /// Expects an object with optional `min_price`, `available` and
    /// `listing_count` fields. `available` defaults to `listing_count > 0`.
    pub fn from_payload(
        payload: &serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, WatchlistError> {
        let object = payload.as_object().ok_or_else(|| {
            WatchlistError::InvalidPayload("expected a JSON object".to_string())
        })?;

        let min_price = match object.get("min_price") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(value.as_f64().ok_or_else(|| {
                WatchlistError::InvalidPayload(format!("min_price is not a number: {value}"))
            })?),
        };
        let listing_count = match object.get("listing_count") {
            None | Some(serde_json::Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    WatchlistError::InvalidPayload(format!("listing_count is not a count: {value}"))
                })?,
        };
        let available = match object.get("available") {
            None | Some(serde_json::Value::Null) => listing_count > 0,
            Some(value) => value.as_bool().ok_or_else(|| {
                WatchlistError::InvalidPayload(format!("available is not a boolean: {value}"))
            })?,
        };

        Ok(Self {
            min_price,
            available,
            listing_count,
            observed_at,
        })
    }
}

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    PriceDelta { from: f64, to: f64, pct: f64 },
    AvailabilityFlip,
    NewListings { from: u32, to: u32 },
}

impl AlertKind {
    /// Severity of this kind of change
    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::AvailabilityFlip => AlertSeverity::Critical,
            Self::PriceDelta { .. } => AlertSeverity::Warning,
            Self::NewListings { .. } => AlertSeverity::Info,
        }
    }

    /// Human readable description
    pub fn describe(&self, entity: &str) -> String {
        match self {
            Self::AvailabilityFlip => format!("Tickets for {entity} are available again"),
            Self::PriceDelta { from, to, pct } => {
                format!("Lowest price for {entity} moved {pct:+.1}% ({from:.2} -> {to:.2})")
            }
            Self::NewListings { from, to } => {
                format!("{} new listings for {entity} ({from} -> {to})", to - from)
            }
        }
    }
}
