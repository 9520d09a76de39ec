//! Error notifications for whoever operates the adapter.

mod email;

pub use email::SmtpNotifier;

use async_trait::async_trait;

use crate::config::NotificationConfig;
use crate::error::NotifyError;

/// Delivers a human-readable message about a sync cycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        tracing::warn!(notification = %message, "Adapter notification");
        Ok(())
    }
}

/// Sends `message`, logging a delivery failure instead of returning it.
pub async fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.send(message).await {
        tracing::error!(error = %e, notification = %message, "Failed to deliver notification");
    }
}

/// The SMTP notifier when a host and recipient are configured, the log otherwise.
pub fn from_config(config: &NotificationConfig) -> Box<dyn Notifier> {
    if config.host.is_some() && !config.to.is_empty() {
        Box::new(SmtpNotifier::new(config.clone()))
    } else {
        tracing::info!("No notification recipient configured, notifications will be logged");
        Box::new(LogNotifier)
    }
}
