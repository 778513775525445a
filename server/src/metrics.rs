//! Business metrics registration.
//!
//! The individual crates record counters at their business points; this
//! module describes them once at startup and stands up the Prometheus
//! exporter.

use ::metrics::describe_counter;
use std::net::SocketAddr;

/// Describe every business metric the crates record.
pub fn register_business_metrics() {
    describe_counter!(
        "reservations_total",
        "Reserve outcomes by kind (reserved, replayed, cancelled)"
    );
    describe_counter!(
        "reservations_rollback_failures_total",
        "Seat holds that could not be rolled back after a ledger write failure"
    );
    describe_counter!(
        "inventory_reservations_total",
        "Inventory engine reserve outcomes (reserved, rejected)"
    );
    describe_counter!("inventory_releases_total", "Seat holds released");
    describe_counter!("bookings_created_total", "Ledger rows created");
    describe_counter!(
        "bookings_transitions_total",
        "Ledger state transitions by target status"
    );
    describe_counter!("bookings_confirmed_total", "Bookings confirmed after payment");
    describe_counter!("bookings_expired_total", "Bookings expired by the sweeper");
    describe_counter!("queue_joins_total", "Queue join outcomes (joined, full)");
    describe_counter!("queue_passes_issued_total", "Queue passes minted and stored");
    describe_counter!("sagas_started_total", "Sagas created from payment.success");
    describe_counter!("sagas_completed_total", "Sagas that finished all steps");
    describe_counter!("sagas_compensated_total", "Sagas rolled back by compensation");
    describe_counter!("saga_steps_failed_total", "Terminal step failures by step");
    describe_counter!("saga_step_retries_total", "Step retries by step");
    describe_counter!("saga_step_timeouts_total", "Steps failed by deadline");
    describe_counter!("saga_refunds_requested_total", "Refund commands relayed");
    describe_counter!(
        "saga_compensation_releases_total",
        "Seat holds released during compensation"
    );
    describe_counter!("saga_dead_letters_total", "Messages written to the DLQ");
    describe_counter!("notifications_sent_total", "Booking notifications delivered");
    describe_counter!("outbox_published_total", "Outbox rows delivered to the bus");
    describe_counter!("outbox_publish_failures_total", "Outbox delivery failures");
    describe_counter!(
        "bus_fire_and_forget_failures_total",
        "Fire-and-forget publishes that failed in the producer callback"
    );

    tracing::info!("business metrics registered");
}

/// Install the Prometheus exporter on the metrics listener.
///
/// # Errors
///
/// Returns the exporter's error if the listener cannot bind.
pub fn install_exporter(addr: SocketAddr) -> Result<(), anyhow::Error> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
