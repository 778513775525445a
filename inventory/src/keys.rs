//! Inventory-store key layout.
//!
//! The same literals are embedded in the Lua scripts in [`crate::redis`];
//! tests below pin the formats so the two cannot drift.

use stampede_core::types::{BookingId, EventId, UserId, ZoneId};

/// Availability counter for a zone.
#[must_use]
pub fn zone_availability(zone_id: &ZoneId) -> String {
    format!("zone:availability:{zone_id}")
}

/// Per-(user, event) reserved-seat counter.
#[must_use]
pub fn user_reservations(user_id: &UserId, event_id: &EventId) -> String {
    format!("user:reservations:{user_id}:{event_id}")
}

/// Ephemeral reservation record for a booking.
#[must_use]
pub fn reservation(booking_id: &BookingId) -> String {
    format!("reservation:{booking_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats_are_stable() {
        let zone = ZoneId::new("vip");
        let user = UserId::new("u1");
        let event = EventId::new("e1");

        assert_eq!(zone_availability(&zone), "zone:availability:vip");
        assert_eq!(user_reservations(&user, &event), "user:reservations:u1:e1");

        let booking = BookingId::new();
        assert_eq!(reservation(&booking), format!("reservation:{booking}"));
    }
}
