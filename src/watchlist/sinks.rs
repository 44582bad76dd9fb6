//! Alert sinks
//!
//! The engine never delivers alerts to users itself. Sinks hand each
//! [`AlertEvent`] to whatever notification collaborator sits downstream.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::criteria::AlertSeverity;
use super::AlertEvent;

/// Errors that can occur while handing off an alert
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Collaborator refused the alert
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Destination for alert events
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Sink name used in logs
    fn name(&self) -> &str;

    /// Hand off one alert
    async fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError>;
}

/// Publishes alerts on a tokio broadcast channel
///
/// Alerts published while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<AlertEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` alerts per receiver
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attach a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl AlertSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        let receivers = self.sender.send(alert.clone()).unwrap_or(0);
        tracing::trace!(receivers, alert_id = %alert.id, "Alert broadcast");
        Ok(())
    }
}

/// Writes alerts to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        match alert.severity {
            AlertSeverity::Critical => tracing::warn!(
                alert_id = %alert.id,
                item_id = %alert.item_id,
                platform = %alert.platform,
                entity = %alert.entity,
                "{}", alert.message
            ),
            _ => tracing::info!(
                alert_id = %alert.id,
                item_id = %alert.item_id,
                platform = %alert.platform,
                entity = %alert.entity,
                severity = %alert.severity,
                "{}", alert.message
            ),
        }
        Ok(())
    }
}
