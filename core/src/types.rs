//! Domain types shared across the Stampede subsystems.
//!
//! Identifiers that originate inside this system (bookings, sagas) are UUID
//! newtypes. Identifiers owned by external collaborators (users, events,
//! shows, zones, tenants) are opaque string newtypes: the upstream gateway
//! and catalog decide their shape, we only key on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(Uuid);

impl BookingId {
    /// Creates a new random `BookingId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `BookingId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a saga instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId(Uuid);

impl SagaId {
    /// Creates a new random `SagaId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `SagaId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an externally issued identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is empty (rejected on every entry point).
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a user, issued by the upstream identity gateway.
    UserId
);
opaque_id!(
    /// Identifier of a tenant (organiser account).
    TenantId
);
opaque_id!(
    /// Identifier of a sale event, owned by the catalog service.
    EventId
);
opaque_id!(
    /// Identifier of a show (one performance of an event).
    ShowId
);
opaque_id!(
    /// Identifier of a pricing/capacity zone within a show.
    ZoneId
);

// ============================================================================
// Booking
// ============================================================================

/// Lifecycle status of a durable booking.
///
/// Transitions are monotonic: `reserved` may move to any of the other three,
/// and all of the other three are terminal for the forward flow (a refund
/// saga may act on a `confirmed` booking downstream, but the row keeps
/// `confirmed`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    /// Seats are held; payment pending inside the reservation window.
    Reserved,
    /// Payment arrived and the booking was confirmed.
    Confirmed,
    /// The customer cancelled before payment.
    Cancelled,
    /// The reservation window elapsed without payment.
    Expired,
}

/// Error returned when parsing a status string from storage.
#[derive(Error, Debug)]
#[error("invalid booking status: {0}")]
pub struct InvalidBookingStatus(pub String);

impl BookingStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidBookingStatus`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, InvalidBookingStatus> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(InvalidBookingStatus(other.to_string())),
        }
    }

    /// True for statuses that no forward transition may leave.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable booking ledger row.
///
/// Created by the reservation service, mutated only by the confirm worker,
/// the cancel path, and the expiration sweeper. Never deleted by normal flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    /// Unique booking id, generated by the reservation service.
    pub id: BookingId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Purchasing user.
    pub user_id: UserId,
    /// Sale event.
    pub event_id: EventId,
    /// Show within the event.
    pub show_id: ShowId,
    /// Zone the seats were taken from.
    pub zone_id: ZoneId,
    /// Number of seats, always >= 1.
    pub quantity: u32,
    /// Price per seat in minor currency units.
    pub unit_price_cents: i64,
    /// Total price; invariant: `unit_price_cents * quantity`.
    pub total_price_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Lifecycle status.
    pub status: BookingStatus,
    /// Caller-supplied idempotency key; unique per user when present.
    pub idempotency_key: Option<String>,
    /// When the seats were reserved.
    pub reserved_at: DateTime<Utc>,
    /// When the unpaid reservation lapses.
    pub reservation_expires_at: DateTime<Utc>,
    /// When the booking was confirmed, if it was.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Human-facing confirmation code, set on confirm.
    pub confirmation_code: Option<String>,
    /// External payment id, set on confirm.
    pub payment_id: Option<String>,
    /// When the booking was cancelled, if it was.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Why the booking left `reserved` without confirming, when recorded.
    pub status_reason: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Total price derived from the unit price and quantity.
    #[must_use]
    pub fn computed_total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn booking_status_roundtrip() {
        for status in [
            BookingStatus::Reserved,
            BookingStatus::Confirmed,
            BookingStatus::Cancelled,
            BookingStatus::Expired,
        ] {
            assert_eq!(BookingStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn booking_status_invalid() {
        assert!(BookingStatus::parse("pending").is_err());
    }

    #[test]
    fn reserved_is_only_non_terminal_status() {
        assert!(!BookingStatus::Reserved.is_terminal());
        assert!(BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::Expired.is_terminal());
    }

    #[test]
    fn opaque_ids_display_their_inner_value() {
        let user = UserId::new("user-42");
        assert_eq!(user.as_str(), "user-42");
        assert_eq!(user.to_string(), "user-42");
        assert!(!user.is_empty());
        assert!(UserId::new("").is_empty());
    }
}
