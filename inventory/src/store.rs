//! The inventory store contract shared by the Redis and in-memory engines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stampede_core::failure::{Classified, FailureKind};
use stampede_core::types::{BookingId, EventId, UserId, ZoneId};
use thiserror::Error;

/// Errors surfaced by the inventory engine.
///
/// All variants except [`InventoryError::Store`] are terminal from the
/// engine's perspective; the caller decides whether to retry `Store`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// Requested quantity was below 1.
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    /// No availability counter exists for the zone.
    #[error("zone not found")]
    ZoneNotFound,

    /// The reservation would push the user past the per-user cap.
    #[error("per-user purchase limit exceeded")]
    UserLimitExceeded,

    /// Fewer seats remain than requested.
    #[error("insufficient stock")]
    InsufficientStock,

    /// No live reservation record for the booking id (absent or expired).
    #[error("reservation not found")]
    ReservationNotFound,

    /// The reservation belongs to a different user.
    #[error("reservation user mismatch")]
    UserMismatch,

    /// The reservation was already confirmed.
    #[error("reservation already confirmed")]
    AlreadyConfirmed,

    /// Transport or evaluation fault in the underlying store.
    #[error("inventory store error: {0}")]
    Store(String),
}

impl InventoryError {
    /// Stable error code surfaced to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::ZoneNotFound => "ZONE_NOT_FOUND",
            Self::UserLimitExceeded => "USER_LIMIT_EXCEEDED",
            Self::InsufficientStock => "INSUFFICIENT_STOCK",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::UserMismatch => "USER_MISMATCH",
            Self::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Map a script-returned code back to the error it encodes.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "INVALID_QUANTITY" => Some(Self::InvalidQuantity),
            "ZONE_NOT_FOUND" => Some(Self::ZoneNotFound),
            "USER_LIMIT_EXCEEDED" => Some(Self::UserLimitExceeded),
            "INSUFFICIENT_STOCK" => Some(Self::InsufficientStock),
            "RESERVATION_NOT_FOUND" => Some(Self::ReservationNotFound),
            "USER_MISMATCH" => Some(Self::UserMismatch),
            "ALREADY_CONFIRMED" => Some(Self::AlreadyConfirmed),
            _ => None,
        }
    }
}

impl Classified for InventoryError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidQuantity | Self::UserLimitExceeded | Self::InsufficientStock => {
                FailureKind::Validation
            },
            Self::ZoneNotFound | Self::ReservationNotFound => FailureKind::NotFound,
            Self::AlreadyConfirmed => FailureKind::Conflict,
            Self::UserMismatch => FailureKind::Unauthorized,
            Self::Store(_) => FailureKind::Retryable,
        }
    }
}

/// Status of a live reservation record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    /// Seats held, TTL running.
    Pending,
    /// Payment arrived; record is permanent until the booking is archived.
    Confirmed,
}

impl ReservationState {
    /// Store string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
        }
    }
}

/// The ephemeral, TTL-bound reservation record keyed by booking id.
#[derive(Clone, Debug, PartialEq)]
pub struct ReservationRecord {
    /// Booking this record belongs to.
    pub booking_id: BookingId,
    /// Reserving user.
    pub user_id: UserId,
    /// Sale event.
    pub event_id: EventId,
    /// Zone the seats came from.
    pub zone_id: ZoneId,
    /// Number of seats held.
    pub quantity: u32,
    /// Price per seat in minor units.
    pub unit_price_cents: i64,
    /// Pending or confirmed.
    pub status: ReservationState,
    /// When the hold was taken.
    pub created_at: DateTime<Utc>,
}

/// Inputs to [`InventoryStore::reserve_seats`].
///
/// The caller generates the booking id outside the engine and passes it in,
/// so the durable ledger row and the ephemeral record share an id.
#[derive(Clone, Debug)]
pub struct ReserveParams {
    /// Pre-generated booking id.
    pub booking_id: BookingId,
    /// Zone to take seats from.
    pub zone_id: ZoneId,
    /// Reserving user.
    pub user_id: UserId,
    /// Sale event (scopes the per-user counter).
    pub event_id: EventId,
    /// Seats requested, must be >= 1.
    pub quantity: u32,
    /// Per-user cap for this event.
    pub max_per_user: u32,
    /// Price per seat in minor units, recorded on the reservation.
    pub unit_price_cents: i64,
    /// Reservation window in seconds.
    pub ttl_seconds: u64,
}

/// Successful reserve result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// Seats remaining in the zone after the decrement.
    pub remaining: i64,
    /// The user's total reserved count for this event after the increment.
    pub user_reserved: i64,
}

/// Successful confirm result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmOutcome {
    /// When the engine stamped the confirmation.
    pub confirmed_at: DateTime<Utc>,
}

/// Successful release result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Seats remaining in the zone after the increment.
    pub remaining: i64,
    /// The user's reserved count after the decrement (floored at 0).
    pub user_reserved: i64,
}

/// The inventory engine contract.
///
/// Every method is externally atomic with respect to every other method on
/// the same store: implementations run each call to completion on a single
/// evaluator without yielding.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Seed (or reset) a zone's availability counter from the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] on transport faults.
    async fn seed_zone(&self, zone_id: &ZoneId, seats: u32) -> Result<(), InventoryError>;

    /// Remove a retired zone's availability counter.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] on transport faults.
    async fn retire_zone(&self, zone_id: &ZoneId) -> Result<(), InventoryError>;

    /// Current availability for a zone, `None` if the zone is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] on transport faults.
    async fn zone_availability(&self, zone_id: &ZoneId) -> Result<Option<i64>, InventoryError>;

    /// The user's live reserved count for an event (0 if absent).
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] on transport faults.
    async fn user_reserved(
        &self,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<i64, InventoryError>;

    /// Atomically reserve seats.
    ///
    /// Validates quantity, zone existence, the per-user cap, and stock, then
    /// decrements availability, increments the user counter (extending its
    /// TTL), and creates the pending reservation record with the same TTL.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidQuantity`], [`InventoryError::ZoneNotFound`],
    /// [`InventoryError::UserLimitExceeded`],
    /// [`InventoryError::InsufficientStock`], or
    /// [`InventoryError::Store`].
    async fn reserve_seats(&self, params: &ReserveParams)
    -> Result<ReserveOutcome, InventoryError>;

    /// Atomically confirm a pending reservation.
    ///
    /// Stamps the payment id, flips the record to confirmed, and removes its
    /// TTL. Zone and user counters are untouched: the seats stay consumed.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ReservationNotFound`],
    /// [`InventoryError::UserMismatch`],
    /// [`InventoryError::AlreadyConfirmed`], or [`InventoryError::Store`].
    async fn confirm_booking(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
        payment_id: &str,
    ) -> Result<ConfirmOutcome, InventoryError>;

    /// Atomically release a pending reservation.
    ///
    /// Returns the seats to the zone, decrements the user counter (never
    /// below zero), and deletes the record. Confirmed reservations are
    /// rejected; refunds of confirmed bookings go through a separate path.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ReservationNotFound`],
    /// [`InventoryError::UserMismatch`],
    /// [`InventoryError::AlreadyConfirmed`], or [`InventoryError::Store`].
    async fn release_seats(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
    ) -> Result<ReleaseOutcome, InventoryError>;

    /// Fetch a live reservation record, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] on transport faults.
    async fn get_reservation(
        &self,
        booking_id: &BookingId,
    ) -> Result<Option<ReservationRecord>, InventoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_roundtrip() {
        for error in [
            InventoryError::InvalidQuantity,
            InventoryError::ZoneNotFound,
            InventoryError::UserLimitExceeded,
            InventoryError::InsufficientStock,
            InventoryError::ReservationNotFound,
            InventoryError::UserMismatch,
            InventoryError::AlreadyConfirmed,
        ] {
            assert_eq!(InventoryError::from_code(error.code()), Some(error));
        }
        assert_eq!(InventoryError::from_code("OK"), None);
    }

    #[test]
    fn only_store_faults_are_retryable() {
        assert!(
            InventoryError::Store("connection reset".to_string())
                .failure_kind()
                .is_retryable()
        );
        assert!(!InventoryError::InsufficientStock.failure_kind().is_retryable());
        assert!(!InventoryError::AlreadyConfirmed.failure_kind().is_retryable());
    }
}
