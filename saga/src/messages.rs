//! Typed payloads for saga traffic.
//!
//! Every payload rides inside a [`stampede_core::message::BusMessage`] whose
//! `event_type` equals the topic name for commands and step events, so a
//! consumer can dispatch on either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stampede_core::failure::FailureKind;
use stampede_core::types::{BookingId, SagaId};

/// Inbound `payment.success` / `payment.failed` payload from the external
/// payment service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentOutcome {
    /// The booking the payment was for.
    pub booking_id: BookingId,
    /// The paying user.
    pub user_id: String,
    /// Payment id at the payment provider.
    pub payment_id: String,
    /// Amount, when the provider includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<i64>,
}

/// A step (or compensation) command from the orchestrator to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepCommand {
    /// Owning saga; also the partition key.
    pub saga_id: SagaId,
    /// Step name (or compensation command name).
    pub step: String,
    /// Booking context.
    pub booking_id: BookingId,
    /// User context.
    pub user_id: String,
    /// Payment context.
    pub payment_id: String,
    /// Snapshot of the saga's data map at command time (step outputs from
    /// earlier steps, e.g. the confirmation code for notification).
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// A worker's success event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepSucceeded {
    /// Owning saga.
    pub saga_id: SagaId,
    /// Step that completed.
    pub step: String,
    /// Output merged into the saga's data map.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// A worker's terminal failure event (retries exhausted or non-retryable).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepFailed {
    /// Owning saga.
    pub saga_id: SagaId,
    /// Step that failed.
    pub step: String,
    /// Final error message.
    pub error: String,
    /// Classification the worker assigned.
    pub kind: FailureKind,
    /// Attempts spent before giving up.
    pub retry_count: u32,
}

/// Scheduled check that a step produced an outcome by its deadline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutCheck {
    /// Owning saga.
    pub saga_id: SagaId,
    /// Step under the deadline.
    pub step: String,
    /// When the step counts as failed if still unresolved.
    pub deadline: DateTime<Utc>,
}

/// Lifecycle notification for monitoring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// The saga.
    pub saga_id: SagaId,
    /// Definition id.
    pub definition_id: String,
    /// New status string.
    pub status: String,
    /// Terminal error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
