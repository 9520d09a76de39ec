//! SMTP delivery of adapter notifications.

use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};

use super::Notifier;
use crate::config::NotificationConfig;
use crate::error::NotifyError;

/// Emails notifications to the configured recipients.
#[derive(Clone)]
pub struct SmtpNotifier {
    config: NotificationConfig,
}

impl SmtpNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    /// Configured body followed by the notification text.
    pub fn compose_body(&self, message: &str) -> String {
        format!("{}\n\n{}", self.config.body, message)
    }

    fn build_message(&self, message: &str) -> Result<Message, NotifyError> {
        if self.config.to.is_empty() {
            return Err(NotifyError::NotConfigured);
        }

        let mut builder = Message::builder()
            .from(
                self.config
                    .from
                    .parse()
                    .map_err(|e| NotifyError::Message(format!("{}", e)))?,
            )
            .subject(self.config.subject.clone())
            .header(ContentType::TEXT_PLAIN);

        for to in &self.config.to {
            builder = builder.to(to
                .parse()
                .map_err(|e| NotifyError::Message(format!("{}", e)))?);
        }

        builder
            .body(self.compose_body(message))
            .map_err(|e| NotifyError::Message(e.to_string()))
    }

    /// Builds the SMTP transport.
    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let host = self.config.host.as_deref().ok_or(NotifyError::NotConfigured)?;

        let mut builder = if self.config.port == 465 {
            // SSL/TLS on port 465
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| NotifyError::Transport(e.to_string()))?
                .port(465)
        } else {
            // STARTTLS on port 587 or plain for local testing
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| NotifyError::Transport(e.to_string()))?
                .port(self.config.port)
        };

        if let (Some(user), Some(pass)) = (&self.config.user, &self.config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let email = self.build_message(message)?;
        let transport = self.build_transport()?;

        transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        tracing::info!(recipients = self.config.to.len(), "Sent notification email");
        Ok(())
    }
}

impl std::fmt::Debug for SmtpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpNotifier")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("from", &self.config.from)
            .finish()
    }
}
