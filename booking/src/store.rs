//! The booking ledger contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stampede_core::failure::{Classified, FailureKind};
use stampede_core::types::{
    Booking, BookingId, EventId, ShowId, TenantId, UserId, ZoneId,
};
use thiserror::Error;

/// Errors surfaced by the booking ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// No row for the booking id.
    #[error("booking not found")]
    NotFound,

    /// Conditional transition found the row already confirmed.
    #[error("booking already confirmed")]
    AlreadyConfirmed,

    /// Conditional transition found the row already cancelled.
    #[error("booking already cancelled")]
    AlreadyCancelled,

    /// Conditional transition found the row already expired.
    #[error("booking already expired")]
    AlreadyExpired,

    /// Create hit the idempotency-key unique index for this user.
    #[error("idempotency key already used")]
    DuplicateIdempotencyKey,

    /// Transport or query fault.
    #[error("booking store error: {0}")]
    Database(String),
}

impl BookingError {
    /// Stable error code surfaced to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Self::AlreadyCancelled => "ALREADY_CANCELLED",
            Self::AlreadyExpired => "ALREADY_EXPIRED",
            Self::DuplicateIdempotencyKey => "DUPLICATE_IDEMPOTENCY_KEY",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Map a stored prior status to the transition error it implies.
    #[must_use]
    pub fn from_prior_status(status: &str) -> Self {
        match status {
            "confirmed" => Self::AlreadyConfirmed,
            "cancelled" => Self::AlreadyCancelled,
            "expired" => Self::AlreadyExpired,
            other => Self::Database(format!("unexpected prior status: {other}")),
        }
    }
}

impl Classified for BookingError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NotFound => FailureKind::NotFound,
            Self::AlreadyConfirmed | Self::AlreadyCancelled | Self::AlreadyExpired
            | Self::DuplicateIdempotencyKey => FailureKind::Conflict,
            Self::Database(_) => FailureKind::Retryable,
        }
    }
}

/// Everything needed to create a ledger row; timestamps and status are
/// stamped by the store.
#[derive(Clone, Debug)]
pub struct NewBooking {
    /// Pre-generated booking id (shared with the inventory record).
    pub id: BookingId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Purchasing user.
    pub user_id: UserId,
    /// Sale event.
    pub event_id: EventId,
    /// Show within the event.
    pub show_id: ShowId,
    /// Zone the seats came from.
    pub zone_id: ZoneId,
    /// Seats reserved.
    pub quantity: u32,
    /// Price per seat in minor units.
    pub unit_price_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Caller idempotency key, unique per user when present.
    pub idempotency_key: Option<String>,
    /// When the unpaid reservation lapses.
    pub reservation_expires_at: DateTime<Utc>,
}

/// The booking ledger.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Insert a new `reserved` booking.
    ///
    /// # Errors
    ///
    /// [`BookingError::DuplicateIdempotencyKey`] when the (user, key) pair
    /// already exists, or [`BookingError::Database`].
    async fn create(&self, booking: &NewBooking) -> Result<Booking, BookingError>;

    /// Fetch a booking by id.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    async fn get_by_id(&self, id: &BookingId) -> Result<Option<Booking>, BookingError>;

    /// Fetch the booking a (user, idempotency key) pair produced, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    async fn get_by_idempotency_key(
        &self,
        user_id: &UserId,
        key: &str,
    ) -> Result<Option<Booking>, BookingError>;

    /// Page through a user's bookings, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    async fn get_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, BookingError>;

    /// `reserved → confirmed`, stamping payment id, confirmation code, and
    /// `confirmed_at`. Fails with the prior-state error otherwise.
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`], [`BookingError::AlreadyConfirmed`],
    /// [`BookingError::AlreadyCancelled`], [`BookingError::AlreadyExpired`],
    /// or [`BookingError::Database`].
    async fn confirm(
        &self,
        id: &BookingId,
        payment_id: &str,
        confirmation_code: &str,
    ) -> Result<Booking, BookingError>;

    /// `reserved → cancelled`, stamping `cancelled_at`.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`BookingStore::confirm`].
    async fn cancel(&self, id: &BookingId) -> Result<Booking, BookingError>;

    /// `reserved → expired`, recording the reason.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`BookingStore::confirm`].
    async fn mark_expired(&self, id: &BookingId, reason: &str) -> Result<Booking, BookingError>;

    /// Bookings still `reserved` whose expiry has passed, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    async fn get_expired_reservations(&self, limit: i64) -> Result<Vec<Booking>, BookingError>;

    /// Count a user's `reserved` and `confirmed` bookings for an event.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    async fn count_by_user_and_event(
        &self,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<i64, BookingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_status_maps_to_transition_errors() {
        assert_eq!(
            BookingError::from_prior_status("confirmed"),
            BookingError::AlreadyConfirmed
        );
        assert_eq!(
            BookingError::from_prior_status("cancelled"),
            BookingError::AlreadyCancelled
        );
        assert_eq!(
            BookingError::from_prior_status("expired"),
            BookingError::AlreadyExpired
        );
        assert!(matches!(
            BookingError::from_prior_status("reserved"),
            BookingError::Database(_)
        ));
    }

    #[test]
    fn conflicts_are_terminal_for_retry() {
        assert!(!BookingError::AlreadyConfirmed.failure_kind().is_retryable());
        assert!(BookingError::Database("timeout".into()).failure_kind().is_retryable());
    }
}
