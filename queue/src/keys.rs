//! Queue-store key layout.
//!
//! The join/leave Lua scripts in [`crate::redis`] embed the same literals;
//! the tests below pin the formats.

use stampede_core::types::{EventId, UserId};

/// Ordered set of waiting users for an event.
#[must_use]
pub fn queue(event_id: &EventId) -> String {
    format!("queue:{event_id}")
}

/// Per-user queue metadata hash.
#[must_use]
pub fn user_info(event_id: &EventId, user_id: &UserId) -> String {
    format!("queue:user:{event_id}:{user_id}")
}

/// Canonical queue-pass value.
#[must_use]
pub fn pass(event_id: &EventId, user_id: &UserId) -> String {
    format!("queue:pass:{event_id}:{user_id}")
}

/// Scan pattern matching every pass for an event.
#[must_use]
pub fn pass_pattern(event_id: &EventId) -> String {
    format!("queue:pass:{event_id}:*")
}

/// Per-event admission configuration hash.
#[must_use]
pub fn config(event_id: &EventId) -> String {
    format!("queue:config:{event_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats_are_stable() {
        let event = EventId::new("e1");
        let user = UserId::new("u1");

        assert_eq!(queue(&event), "queue:e1");
        assert_eq!(user_info(&event, &user), "queue:user:e1:u1");
        assert_eq!(pass(&event, &user), "queue:pass:e1:u1");
        assert_eq!(pass_pattern(&event), "queue:pass:e1:*");
        assert_eq!(config(&event), "queue:config:e1");
    }
}
