//! The confirm path, shared by the HTTP surface and the saga's
//! confirm-booking worker.
//!
//! Confirm order matters: the inventory record is flipped first (stopping
//! the TTL), then the ledger row, then the queue pass is consumed. The
//! ledger stages `booking.confirmed` in the same transaction as the row
//! flip; the outbox relay delivers it. Every step is idempotent, so a
//! redelivered command converges on the same state instead of failing.

use crate::store::{BookingError, BookingStore};
use rand::Rng;
use stampede_core::types::{Booking, BookingId, UserId};
use stampede_inventory::{InventoryError, InventoryStore};
use stampede_queue::QueueController;
use std::sync::Arc;

/// Characters used in confirmation codes (no ambiguous 0/O/1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a human-facing confirmation code, e.g. `K7KQ-2MNA`.
#[must_use]
pub fn confirmation_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.gen_range(0..CODE_ALPHABET.len());
        code.push(char::from(CODE_ALPHABET[idx]));
    }
    code
}

/// Confirm a booking after payment: inventory record, ledger row, pass.
///
/// Idempotent: `ALREADY_CONFIRMED` from either store means a previous
/// delivery got there first and the stored booking is returned unchanged.
///
/// # Errors
///
/// [`BookingError::NotFound`] when the ledger has no row,
/// [`BookingError::AlreadyCancelled`] / `AlreadyExpired` when payment lost
/// the race, or transport faults from either store.
pub async fn confirm_booking(
    bookings: &Arc<dyn BookingStore>,
    inventory: &Arc<dyn InventoryStore>,
    queue: &Arc<QueueController>,
    booking_id: &BookingId,
    user_id: &UserId,
    payment_id: &str,
) -> Result<Booking, BookingError> {
    // Engine first: removes the TTL so the hold can no longer lapse while
    // the ledger write is in flight.
    match inventory.confirm_booking(booking_id, user_id, payment_id).await {
        // Already confirmed: a previous delivery of this command won.
        Ok(_) | Err(InventoryError::AlreadyConfirmed) => {},
        // The record lapsed (or never reached this shard); the ledger row
        // is authoritative for the error the caller sees.
        Err(InventoryError::ReservationNotFound) => {
            tracing::warn!(
                booking_id = %booking_id,
                "no live inventory record at confirm; deferring to ledger state"
            );
        },
        Err(InventoryError::UserMismatch) => return Err(BookingError::NotFound),
        Err(error) => return Err(BookingError::Database(error.to_string())),
    }

    let booking = match bookings
        .confirm(booking_id, payment_id, &confirmation_code())
        .await
    {
        Ok(booking) => booking,
        // Redelivery: the row is already confirmed, return it as-is.
        Err(BookingError::AlreadyConfirmed) => bookings
            .get_by_id(booking_id)
            .await?
            .ok_or(BookingError::NotFound)?,
        Err(error) => return Err(error),
    };

    if let Err(error) = queue.delete_pass(&booking.event_id, user_id).await {
        tracing::warn!(
            booking_id = %booking_id,
            error = %error,
            "failed to delete queue pass after confirmation"
        );
    }

    metrics::counter!("bookings_confirmed_total").increment(1);
    tracing::info!(
        booking_id = %booking.id,
        payment_id,
        confirmation_code = booking.confirmation_code.as_deref().unwrap_or(""),
        "booking confirmed"
    );

    Ok(booking)
}
