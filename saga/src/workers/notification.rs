//! The send-notification worker (NON-CRITICAL step).

use crate::definition::steps;
use crate::workers::{CommandHandler, StepWorkerContext};
use async_trait::async_trait;
use serde_json::Map;
use stampede_core::failure::FailureKind;
use stampede_core::message::BusMessage;
use stampede_core::types::BookingId;
use std::sync::Arc;
use thiserror::Error;

/// Notification delivery failure, carrying its retry classification.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct NotifyError {
    /// What went wrong.
    pub message: String,
    /// Whether retrying can help.
    pub kind: FailureKind,
}

impl NotifyError {
    /// A transient delivery fault.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retryable,
        }
    }

    /// A permanent fault (bad address, rejected template).
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Validation,
        }
    }
}

/// Notification delivery seam. Production deployments put their email/push
/// provider behind this; development logs.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send the booking-confirmed notification.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] with a retry classification.
    async fn send_booking_confirmation(
        &self,
        user_id: &str,
        booking_id: &BookingId,
        confirmation_code: Option<&str>,
    ) -> Result<(), NotifyError>;
}

/// Logs the notification instead of delivering it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_booking_confirmation(
        &self,
        user_id: &str,
        booking_id: &BookingId,
        confirmation_code: Option<&str>,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            user_id,
            booking_id = %booking_id,
            confirmation_code = confirmation_code.unwrap_or(""),
            "booking confirmation notification (log only)"
        );
        Ok(())
    }
}

/// Executes `send-notification` commands.
pub struct NotificationWorker {
    notifier: Arc<dyn Notifier>,
    ctx: StepWorkerContext,
}

impl NotificationWorker {
    /// Wire up the worker.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, ctx: StepWorkerContext) -> Self {
        Self { notifier, ctx }
    }
}

#[async_trait]
impl CommandHandler for NotificationWorker {
    fn name(&self) -> &'static str {
        "notification-worker"
    }

    fn topics(&self) -> Vec<String> {
        vec![stampede_bus::topics::saga_command(steps::SEND_NOTIFICATION)]
    }

    async fn handle(&self, message: &BusMessage) {
        let topic = stampede_bus::topics::saga_command(steps::SEND_NOTIFICATION);
        let Some(command) = self.ctx.decode_command(&topic, message).await else {
            return;
        };

        let confirmation_code = command
            .context
            .get("confirmation_code")
            .and_then(serde_json::Value::as_str);

        match self
            .notifier
            .send_booking_confirmation(&command.user_id, &command.booking_id, confirmation_code)
            .await
        {
            Ok(()) => {
                metrics::counter!("notifications_sent_total").increment(1);
                self.ctx.report_success(&command, Map::new()).await;
            },
            Err(error) => {
                let kind = error.kind;
                self.ctx
                    .report_failure(&topic, message, &command, error.to_string(), kind, true)
                    .await;
            },
        }
    }
}
