//! Compensation worker: undoes the pre-completed context steps when a
//! critical step fails.
//!
//! Two commands:
//!
//! - `compensate-process-payment`: relays a refund request onto
//!   `payment.events` for the external payment service.
//! - `compensate-reserve-seats`: releases the seat hold through the
//!   inventory engine.
//!
//! Both are idempotent: a redelivered release finds no record and stops; a
//! redelivered refund request is collapsed by the payment service on the
//! payment id.

use crate::definition::steps;
use crate::workers::{CommandHandler, StepWorkerContext};
use async_trait::async_trait;
use stampede_bus::topics::{self, event_types};
use stampede_core::event_bus::EventBus;
use stampede_core::failure::{Classified, FailureKind};
use stampede_core::message::BusMessage;
use stampede_core::types::UserId;
use stampede_inventory::{InventoryError, InventoryStore};
use std::sync::Arc;

/// Executes `compensate-*` commands.
pub struct CompensationWorker {
    inventory: Arc<dyn InventoryStore>,
    bus: Arc<dyn EventBus>,
    ctx: StepWorkerContext,
}

impl CompensationWorker {
    /// Wire up the worker.
    #[must_use]
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        bus: Arc<dyn EventBus>,
        ctx: StepWorkerContext,
    ) -> Self {
        Self {
            inventory,
            bus,
            ctx,
        }
    }

    async fn refund_payment(
        &self,
        message: &BusMessage,
        command: &crate::messages::StepCommand,
        topic: &str,
    ) {
        let payload = serde_json::json!({
            "booking_id": command.booking_id,
            "user_id": command.user_id,
            "payment_id": command.payment_id,
            "reason": "booking confirmation failed",
        });

        let refund = match BusMessage::new(
            event_types::PAYMENT_REFUND_REQUESTED,
            self.ctx.source,
            &payload,
        ) {
            Ok(refund) => refund.with_saga_id(command.saga_id),
            Err(error) => {
                tracing::error!(error = %error, "failed to encode refund request");
                return;
            },
        };

        match self
            .bus
            .publish(
                topics::PAYMENT_EVENTS,
                &command.booking_id.to_string(),
                &refund,
            )
            .await
        {
            Ok(()) => {
                metrics::counter!("saga_refunds_requested_total").increment(1);
                tracing::info!(
                    saga_id = %command.saga_id,
                    payment_id = %command.payment_id,
                    "refund requested"
                );
            },
            Err(error) => {
                self.ctx
                    .report_failure(
                        topic,
                        message,
                        command,
                        error.to_string(),
                        FailureKind::Retryable,
                        false,
                    )
                    .await;
            },
        }
    }

    async fn release_seats(
        &self,
        message: &BusMessage,
        command: &crate::messages::StepCommand,
        topic: &str,
    ) {
        let user_id = UserId::new(command.user_id.clone());
        match self
            .inventory
            .release_seats(&command.booking_id, &user_id)
            .await
        {
            Ok(outcome) => {
                metrics::counter!("saga_compensation_releases_total").increment(1);
                tracing::info!(
                    saga_id = %command.saga_id,
                    booking_id = %command.booking_id,
                    remaining = outcome.remaining,
                    "seats released by compensation"
                );
            },
            // TTL got there first; the hold is already gone.
            Err(InventoryError::ReservationNotFound) => {
                tracing::debug!(
                    saga_id = %command.saga_id,
                    booking_id = %command.booking_id,
                    "no live hold to release"
                );
            },
            // A confirm landed between the failure and this compensation;
            // the confirmed booking keeps its seats, the refund stands.
            Err(InventoryError::AlreadyConfirmed) => {
                tracing::warn!(
                    saga_id = %command.saga_id,
                    booking_id = %command.booking_id,
                    "hold already confirmed, leaving seats consumed"
                );
            },
            Err(error) => {
                let kind = error.failure_kind();
                self.ctx
                    .report_failure(topic, message, command, error.to_string(), kind, false)
                    .await;
            },
        }
    }
}

#[async_trait]
impl CommandHandler for CompensationWorker {
    fn name(&self) -> &'static str {
        "compensation-worker"
    }

    fn topics(&self) -> Vec<String> {
        vec![
            topics::saga_command(&steps::compensation_for(steps::PROCESS_PAYMENT)),
            topics::saga_command(&steps::compensation_for(steps::RESERVE_SEATS)),
        ]
    }

    async fn handle(&self, message: &BusMessage) {
        let topic = message.event_type.clone();
        let Some(command) = self.ctx.decode_command(&topic, message).await else {
            return;
        };

        match command.step.as_str() {
            "compensate-process-payment" => {
                self.refund_payment(message, &command, &topic).await;
            },
            "compensate-reserve-seats" => {
                self.release_seats(message, &command, &topic).await;
            },
            other => {
                tracing::warn!(step = other, "unknown compensation command");
            },
        }
    }
}
