//! Topic names and event type strings used across the booking core.
//!
//! Keeping them in one module prevents the orchestrator and workers from
//! drifting apart on spelling; the partition layout depends on everyone
//! producing to the same names.

/// Booking lifecycle events: `booking.created` / `.confirmed` / `.cancelled`
/// / `.expired`.
pub const BOOKING_EVENTS: &str = "booking.events";

/// Inbound payment outcomes from the external payment service:
/// `payment.success` / `payment.failed`, plus outbound refund commands.
pub const PAYMENT_EVENTS: &str = "payment.events";

/// Dead-letter topic; entries are also persisted in the dead-letter table.
pub const SAGA_DLQ: &str = "saga.booking.dlq";

/// Scheduled timeout checks for in-flight saga steps.
pub const SAGA_TIMEOUT_CHECK: &str = "saga.booking.timeout-check";

/// Command topic for a saga step, e.g. `saga.booking.cmd.confirm-booking`.
#[must_use]
pub fn saga_command(step: &str) -> String {
    format!("saga.booking.cmd.{step}")
}

/// Success event topic for a saga step.
#[must_use]
pub fn saga_success(step: &str) -> String {
    format!("saga.booking.evt.{step}.success")
}

/// Failure event topic for a saga step.
#[must_use]
pub fn saga_failure(step: &str) -> String {
    format!("saga.booking.evt.{step}.failure")
}

/// Lifecycle topic for saga monitoring:
/// `saga.booking.lifecycle.{started|completed|failed|compensated}`.
#[must_use]
pub fn saga_lifecycle(phase: &str) -> String {
    format!("saga.booking.lifecycle.{phase}")
}

/// Event type strings carried in [`stampede_core::message::BusMessage`]
/// headers.
pub mod event_types {
    /// A booking was created (seats held, payment pending).
    pub const BOOKING_CREATED: &str = "booking.created";
    /// A booking was confirmed after payment.
    pub const BOOKING_CONFIRMED: &str = "booking.confirmed";
    /// A booking was cancelled by the customer.
    pub const BOOKING_CANCELLED: &str = "booking.cancelled";
    /// A reservation lapsed without payment.
    pub const BOOKING_EXPIRED: &str = "booking.expired";
    /// Payment succeeded (inbound from the payment service).
    pub const PAYMENT_SUCCESS: &str = "payment.success";
    /// Payment failed (inbound from the payment service).
    pub const PAYMENT_FAILED: &str = "payment.failed";
    /// Refund request emitted during compensation.
    pub const PAYMENT_REFUND_REQUESTED: &str = "payment.refund.requested";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_topic_builders_match_the_wire_layout() {
        assert_eq!(
            saga_command("confirm-booking"),
            "saga.booking.cmd.confirm-booking"
        );
        assert_eq!(
            saga_success("send-notification"),
            "saga.booking.evt.send-notification.success"
        );
        assert_eq!(
            saga_failure("confirm-booking"),
            "saga.booking.evt.confirm-booking.failure"
        );
        assert_eq!(saga_lifecycle("compensated"), "saga.booking.lifecycle.compensated");
    }
}
