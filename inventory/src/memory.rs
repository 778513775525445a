//! In-memory inventory engine for tests and single-node development.
//!
//! One mutex guards the whole state; each operation runs to completion
//! inside the critical section, giving the same externally-observable
//! atomicity as the Redis scripts. TTLs are modelled with expiry instants
//! checked lazily on access, driven by an injected [`Clock`] so tests can
//! step time instead of sleeping.

use crate::redis::RESERVATION_TTL_GRACE_SECONDS;
use crate::store::{
    ConfirmOutcome, InventoryError, InventoryStore, ReleaseOutcome, ReservationRecord,
    ReservationState, ReserveOutcome, ReserveParams,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use stampede_core::clock::{Clock, SystemClock};
use stampede_core::types::{BookingId, EventId, UserId, ZoneId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct UserCounter {
    count: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct StoredReservation {
    record: ReservationRecord,
    /// `None` once confirmed (TTL removed).
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    zones: HashMap<String, i64>,
    user_counters: HashMap<String, UserCounter>,
    reservations: HashMap<BookingId, StoredReservation>,
}

impl State {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.user_counters.retain(|_, counter| counter.expires_at > now);
        self.reservations
            .retain(|_, stored| stored.expires_at.is_none_or(|expiry| expiry > now));
    }
}

/// In-memory implementation of [`InventoryStore`].
#[derive(Clone)]
pub struct InMemoryInventoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInventoryStore {
    /// Create a store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on an injected clock (tests).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, InventoryError> {
        self.state
            .lock()
            .map_err(|_| InventoryError::Store("inventory state poisoned".to_string()))
    }

    fn counter_key(user_id: &UserId, event_id: &EventId) -> String {
        format!("{user_id}:{event_id}")
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn seed_zone(&self, zone_id: &ZoneId, seats: u32) -> Result<(), InventoryError> {
        let mut state = self.lock()?;
        state.zones.insert(zone_id.to_string(), i64::from(seats));
        Ok(())
    }

    async fn retire_zone(&self, zone_id: &ZoneId) -> Result<(), InventoryError> {
        let mut state = self.lock()?;
        state.zones.remove(zone_id.as_str());
        Ok(())
    }

    async fn zone_availability(&self, zone_id: &ZoneId) -> Result<Option<i64>, InventoryError> {
        let state = self.lock()?;
        Ok(state.zones.get(zone_id.as_str()).copied())
    }

    async fn user_reserved(
        &self,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<i64, InventoryError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.purge_expired(now);
        Ok(state
            .user_counters
            .get(&Self::counter_key(user_id, event_id))
            .map_or(0, |counter| counter.count))
    }

    async fn reserve_seats(
        &self,
        params: &ReserveParams,
    ) -> Result<ReserveOutcome, InventoryError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.purge_expired(now);

        if params.quantity < 1 {
            return Err(InventoryError::InvalidQuantity);
        }

        let Some(&available) = state.zones.get(params.zone_id.as_str()) else {
            return Err(InventoryError::ZoneNotFound);
        };

        let counter_key = Self::counter_key(&params.user_id, &params.event_id);
        let reserved = state
            .user_counters
            .get(&counter_key)
            .map_or(0, |counter| counter.count);

        if reserved + i64::from(params.quantity) > i64::from(params.max_per_user) {
            return Err(InventoryError::UserLimitExceeded);
        }
        if available < i64::from(params.quantity) {
            return Err(InventoryError::InsufficientStock);
        }

        #[allow(clippy::cast_possible_wrap)]
        let ttl = Duration::seconds((params.ttl_seconds + RESERVATION_TTL_GRACE_SECONDS) as i64);

        let remaining = available - i64::from(params.quantity);
        state.zones.insert(params.zone_id.to_string(), remaining);

        let user_reserved = reserved + i64::from(params.quantity);
        // TTL extended on every reserve, matching the Redis script.
        state.user_counters.insert(
            counter_key,
            UserCounter {
                count: user_reserved,
                expires_at: now + ttl,
            },
        );

        state.reservations.insert(
            params.booking_id,
            StoredReservation {
                record: ReservationRecord {
                    booking_id: params.booking_id,
                    user_id: params.user_id.clone(),
                    event_id: params.event_id.clone(),
                    zone_id: params.zone_id.clone(),
                    quantity: params.quantity,
                    unit_price_cents: params.unit_price_cents,
                    status: ReservationState::Pending,
                    created_at: now,
                },
                expires_at: Some(now + ttl),
            },
        );

        Ok(ReserveOutcome {
            remaining,
            user_reserved,
        })
    }

    async fn confirm_booking(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
        _payment_id: &str,
    ) -> Result<ConfirmOutcome, InventoryError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.purge_expired(now);

        let stored = state
            .reservations
            .get_mut(booking_id)
            .ok_or(InventoryError::ReservationNotFound)?;

        if stored.record.user_id != *user_id {
            return Err(InventoryError::UserMismatch);
        }
        if stored.record.status == ReservationState::Confirmed {
            return Err(InventoryError::AlreadyConfirmed);
        }

        stored.record.status = ReservationState::Confirmed;
        stored.expires_at = None;

        Ok(ConfirmOutcome { confirmed_at: now })
    }

    async fn release_seats(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
    ) -> Result<ReleaseOutcome, InventoryError> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.purge_expired(now);

        let stored = state
            .reservations
            .get(booking_id)
            .ok_or(InventoryError::ReservationNotFound)?;

        if stored.record.user_id != *user_id {
            return Err(InventoryError::UserMismatch);
        }
        if stored.record.status == ReservationState::Confirmed {
            return Err(InventoryError::AlreadyConfirmed);
        }

        let quantity = i64::from(stored.record.quantity);
        let zone_key = stored.record.zone_id.to_string();
        let counter_key = Self::counter_key(user_id, &stored.record.event_id);

        let remaining = state.zones.get(&zone_key).map_or(quantity, |&v| v + quantity);
        state.zones.insert(zone_key, remaining);

        let current = state
            .user_counters
            .get(&counter_key)
            .map_or(0, |counter| counter.count);
        let user_reserved = if current > quantity {
            let new_count = current - quantity;
            if let Some(counter) = state.user_counters.get_mut(&counter_key) {
                counter.count = new_count;
            }
            new_count
        } else {
            state.user_counters.remove(&counter_key);
            0
        };

        state.reservations.remove(booking_id);

        Ok(ReleaseOutcome {
            remaining,
            user_reserved,
        })
    }

    async fn get_reservation(
        &self,
        booking_id: &BookingId,
    ) -> Result<Option<ReservationRecord>, InventoryError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.purge_expired(now);
        Ok(state
            .reservations
            .get(booking_id)
            .map(|stored| stored.record.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stampede_core::clock::FixedClock;

    fn params(zone: &ZoneId, user: &str, quantity: u32) -> ReserveParams {
        ReserveParams {
            booking_id: BookingId::new(),
            zone_id: zone.clone(),
            user_id: UserId::new(user),
            event_id: EventId::new("e1"),
            quantity,
            max_per_user: 10,
            unit_price_cents: 2500,
            ttl_seconds: 600,
        }
    }

    #[tokio::test]
    async fn reserve_decrements_and_release_restores() {
        let store = InMemoryInventoryStore::new();
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 8).await.unwrap();

        let request = params(&zone, "u1", 3);
        let outcome = store.reserve_seats(&request).await.unwrap();
        assert_eq!(outcome.remaining, 5);
        assert_eq!(outcome.user_reserved, 3);

        let release = store
            .release_seats(&request.booking_id, &request.user_id)
            .await
            .unwrap();
        assert_eq!(release.remaining, 8);
        assert_eq!(release.user_reserved, 0);
        assert_eq!(store.zone_availability(&zone).await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn unknown_zone_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let err = store
            .reserve_seats(&params(&ZoneId::new("missing"), "u1", 1))
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::ZoneNotFound);
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 8).await.unwrap();
        let err = store
            .reserve_seats(&params(&zone, "u1", 0))
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::InvalidQuantity);
    }

    #[tokio::test]
    async fn user_cap_counts_across_reservations() {
        let store = InMemoryInventoryStore::new();
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 100).await.unwrap();

        let mut first = params(&zone, "u1", 8);
        first.max_per_user = 10;
        store.reserve_seats(&first).await.unwrap();

        let mut second = params(&zone, "u1", 5);
        second.max_per_user = 10;
        let err = store.reserve_seats(&second).await.unwrap_err();
        assert_eq!(err, InventoryError::UserLimitExceeded);

        // Counters unchanged by the rejected attempt.
        assert_eq!(
            store
                .user_reserved(&second.user_id, &second.event_id)
                .await
                .unwrap(),
            8
        );
        assert_eq!(store.zone_availability(&zone).await.unwrap(), Some(92));
    }

    #[tokio::test]
    async fn confirm_is_permanent_and_blocks_release() {
        let store = InMemoryInventoryStore::new();
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 4).await.unwrap();

        let request = params(&zone, "u1", 2);
        store.reserve_seats(&request).await.unwrap();
        store
            .confirm_booking(&request.booking_id, &request.user_id, "pay-1")
            .await
            .unwrap();

        let err = store
            .confirm_booking(&request.booking_id, &request.user_id, "pay-1")
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::AlreadyConfirmed);

        let err = store
            .release_seats(&request.booking_id, &request.user_id)
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::AlreadyConfirmed);

        // Seats stay consumed.
        assert_eq!(store.zone_availability(&zone).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn wrong_user_cannot_touch_a_reservation() {
        let store = InMemoryInventoryStore::new();
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 4).await.unwrap();

        let request = params(&zone, "u1", 1);
        store.reserve_seats(&request).await.unwrap();

        let intruder = UserId::new("u2");
        assert_eq!(
            store
                .release_seats(&request.booking_id, &intruder)
                .await
                .unwrap_err(),
            InventoryError::UserMismatch
        );
        assert_eq!(
            store
                .confirm_booking(&request.booking_id, &intruder, "pay-1")
                .await
                .unwrap_err(),
            InventoryError::UserMismatch
        );
    }

    #[tokio::test]
    async fn pending_reservation_expires_with_its_ttl() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = InMemoryInventoryStore::with_clock(clock.clone());
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 4).await.unwrap();

        let mut request = params(&zone, "u1", 2);
        request.ttl_seconds = 60;
        store.reserve_seats(&request).await.unwrap();

        assert!(
            store
                .get_reservation(&request.booking_id)
                .await
                .unwrap()
                .is_some()
        );

        // Jump past the window plus the sweeper grace.
        #[allow(clippy::cast_possible_wrap)]
        clock.advance_secs(60 + RESERVATION_TTL_GRACE_SECONDS as i64 + 1);

        assert!(
            store
                .get_reservation(&request.booking_id)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store
                .release_seats(&request.booking_id, &request.user_id)
                .await
                .unwrap_err(),
            InventoryError::ReservationNotFound
        );
        // The user counter lapsed with the reservation.
        assert_eq!(
            store
                .user_reserved(&request.user_id, &request.event_id)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn confirmed_reservation_survives_time() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = InMemoryInventoryStore::with_clock(clock.clone());
        let zone = ZoneId::new("ga");
        store.seed_zone(&zone, 4).await.unwrap();

        let mut request = params(&zone, "u1", 1);
        request.ttl_seconds = 60;
        store.reserve_seats(&request).await.unwrap();
        store
            .confirm_booking(&request.booking_id, &request.user_id, "pay-1")
            .await
            .unwrap();

        clock.advance_secs(3600);

        let record = store
            .get_reservation(&request.booking_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ReservationState::Confirmed);
    }
}
