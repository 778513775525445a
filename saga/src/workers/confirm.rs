//! The confirm-booking worker (CRITICAL step).

use crate::definition::steps;
use crate::workers::{CommandHandler, StepWorkerContext};
use async_trait::async_trait;
use serde_json::{Map, Value};
use stampede_booking::confirmation;
use stampede_booking::store::BookingStore;
use stampede_core::failure::Classified;
use stampede_core::message::BusMessage;
use stampede_core::types::UserId;
use stampede_inventory::InventoryStore;
use stampede_queue::QueueController;
use std::sync::Arc;

/// Executes `confirm-booking` commands: flips the inventory record, the
/// ledger row (which stages `booking.confirmed`), and consumes the queue
/// pass, then reports the outcome.
pub struct ConfirmBookingWorker {
    bookings: Arc<dyn BookingStore>,
    inventory: Arc<dyn InventoryStore>,
    queue: Arc<QueueController>,
    ctx: StepWorkerContext,
}

impl ConfirmBookingWorker {
    /// Wire up the worker.
    #[must_use]
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        inventory: Arc<dyn InventoryStore>,
        queue: Arc<QueueController>,
        ctx: StepWorkerContext,
    ) -> Self {
        Self {
            bookings,
            inventory,
            queue,
            ctx,
        }
    }
}

#[async_trait]
impl CommandHandler for ConfirmBookingWorker {
    fn name(&self) -> &'static str {
        "confirm-booking-worker"
    }

    fn topics(&self) -> Vec<String> {
        vec![stampede_bus::topics::saga_command(steps::CONFIRM_BOOKING)]
    }

    async fn handle(&self, message: &BusMessage) {
        let topic = stampede_bus::topics::saga_command(steps::CONFIRM_BOOKING);
        let Some(command) = self.ctx.decode_command(&topic, message).await else {
            return;
        };

        let user_id = UserId::new(command.user_id.clone());
        match confirmation::confirm_booking(
            &self.bookings,
            &self.inventory,
            &self.queue,
            &command.booking_id,
            &user_id,
            &command.payment_id,
        )
        .await
        {
            Ok(booking) => {
                let mut data = Map::new();
                if let Some(code) = &booking.confirmation_code {
                    data.insert(
                        "confirmation_code".to_string(),
                        Value::String(code.clone()),
                    );
                }
                if let Some(confirmed_at) = booking.confirmed_at {
                    data.insert(
                        "confirmed_at".to_string(),
                        Value::String(confirmed_at.to_rfc3339()),
                    );
                }
                self.ctx.report_success(&command, data).await;
            },
            Err(error) => {
                let kind = error.failure_kind();
                self.ctx
                    .report_failure(&topic, message, &command, error.to_string(), kind, true)
                    .await;
            },
        }
    }
}
