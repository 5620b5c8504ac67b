//! Outbound notifications for breaker trips and terminal failures.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Error from a notification channel.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Delivery to the channel failed.
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Result type for notification operations.
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Which message is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationTemplate {
    /// Failure count crossed the warning threshold.
    BreakerWarning,
    /// Failure count crossed the disable threshold; operations suspended.
    BreakerDisabled,
    /// An operation went terminal with an exception.
    OperationFailed,
    /// A synchronization run ended with a fatal error.
    SyncRunFailed,
}

impl NotificationTemplate {
    /// Stable template key used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::BreakerWarning => "breaker_warning",
            NotificationTemplate::BreakerDisabled => "breaker_disabled",
            NotificationTemplate::OperationFailed => "operation_failed",
            NotificationTemplate::SyncRunFailed => "sync_run_failed",
        }
    }
}

/// Delivery channel for operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a templated notification to the given recipients.
    async fn notify(
        &self,
        recipients: &[String],
        template: NotificationTemplate,
        context: &Value,
    ) -> NotifyResult<()>;
}

/// Notifier that writes to the log instead of an external channel.
///
/// The default wiring; deployments plug in mail or chat channels by
/// implementing [`Notifier`] themselves.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        recipients: &[String],
        template: NotificationTemplate,
        context: &Value,
    ) -> NotifyResult<()> {
        warn!(
            template = template.as_str(),
            recipients = recipients.join(","),
            %context,
            "operator notification"
        );
        Ok(())
    }
}
