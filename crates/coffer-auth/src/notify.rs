//! Notification boundary.
//!
//! The core never delivers notifications itself; it publishes events through
//! the [`Notifier`] capability and moves on. Dispatch happens on a separately
//! scheduled task: it never blocks the response path, it is not cancelled
//! with the request, and failures go only to the log.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Notification events the auth core emits.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A password-reset code for the target email. Carries the plaintext
    /// secret; it exists only in flight and is never persisted.
    PasswordResetCode {
        /// Recipient email
        email: String,
        /// The plaintext 6-character code
        code: String,
    },
    /// A password reset completed successfully.
    PasswordResetSucceeded {
        /// Recipient email
        email: String,
    },
    /// A new MFA device finished enrollment.
    DeviceEnrolled {
        /// Recipient email
        email: String,
        /// Device name
        device_name: String,
    },
}

impl Notification {
    /// Event kind for logging. Never includes the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PasswordResetCode { .. } => "password_reset_code",
            Self::PasswordResetSucceeded { .. } => "password_reset_succeeded",
            Self::DeviceEnrolled { .. } => "device_enrolled",
        }
    }

    /// Recipient email.
    pub fn recipient(&self) -> &str {
        match self {
            Self::PasswordResetCode { email, .. }
            | Self::PasswordResetSucceeded { email }
            | Self::DeviceEnrolled { email, .. } => email,
        }
    }
}

/// Notifier failure.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Publishing the event failed
    #[error("notification publish failed: {0}")]
    Publish(String),
}

/// Outbound notification capability. Implemented by the platform's messaging
/// fan-out; the core only knows this trait.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: Notification) -> Result<(), NotifyError>;
}

/// Default notifier: records that an event happened and drops it. Used in
/// development and tests. Logs the event kind and recipient, never the
/// payload.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, event: Notification) -> Result<(), NotifyError> {
        info!(
            kind = event.kind(),
            recipient = event.recipient(),
            "notification event"
        );
        Ok(())
    }
}

/// Fire-and-forget dispatch on a spawned task.
///
/// The task outlives the request that triggered it; failures are logged and
/// swallowed.
pub fn dispatch(notifier: Arc<dyn Notifier>, event: Notification) {
    tokio::spawn(async move {
        let kind = event.kind();
        if let Err(e) = notifier.publish(event).await {
            warn!(kind, error = %e, "notification dispatch failed");
        }
    });
}
