//! In-memory booking ledger for tests and single-node development.
//!
//! Mirrors the Postgres store's contract, including outbox staging: every
//! mutation records its lifecycle event in an [`InMemoryOutboxStore`] that
//! tests (and a relay) can drain.

use crate::outbox::{InMemoryOutboxStore, NewOutboxEntry, OutboxStore};
use crate::store::{BookingError, BookingStore, NewBooking};
use async_trait::async_trait;
use stampede_bus::topics::event_types;
use stampede_core::clock::{Clock, SystemClock};
use stampede_core::types::{Booking, BookingId, BookingStatus, EventId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    bookings: HashMap<BookingId, Booking>,
    /// (user id, idempotency key) -> booking id.
    idempotency: HashMap<(String, String), BookingId>,
}

/// In-memory implementation of [`BookingStore`].
#[derive(Clone)]
pub struct InMemoryBookingStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl Default for InMemoryBookingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBookingStore {
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
            outbox: Arc::new(InMemoryOutboxStore::new()),
        }
    }

    /// The outbox this ledger stages lifecycle events into; hand it to an
    /// `OutboxRelay` (or assert on it directly in tests).
    #[must_use]
    pub fn outbox(&self) -> Arc<InMemoryOutboxStore> {
        Arc::clone(&self.outbox)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, BookingError> {
        self.state
            .lock()
            .map_err(|_| BookingError::Database("booking state poisoned".to_string()))
    }

    fn transition(
        &self,
        id: &BookingId,
        apply: impl FnOnce(&mut Booking),
    ) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let booking = state.bookings.get_mut(id).ok_or(BookingError::NotFound)?;

        if booking.status != BookingStatus::Reserved {
            return Err(BookingError::from_prior_status(booking.status.as_str()));
        }

        apply(booking);
        booking.updated_at = now;
        Ok(booking.clone())
    }

    async fn stage_event(
        &self,
        booking: &Booking,
        event_type: &str,
    ) -> Result<(), BookingError> {
        let entry = NewOutboxEntry::booking_event(booking, event_type)
            .map_err(|e| BookingError::Database(e.to_string()))?;
        self.outbox
            .enqueue(&entry)
            .await
            .map_err(|e| BookingError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn create(&self, booking: &NewBooking) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let row = {
            let mut state = self.lock()?;

            if let Some(key) = &booking.idempotency_key {
                let index_key = (booking.user_id.to_string(), key.clone());
                if state.idempotency.contains_key(&index_key) {
                    return Err(BookingError::DuplicateIdempotencyKey);
                }
                state.idempotency.insert(index_key, booking.id);
            }

            let row = Booking {
                id: booking.id,
                tenant_id: booking.tenant_id.clone(),
                user_id: booking.user_id.clone(),
                event_id: booking.event_id.clone(),
                show_id: booking.show_id.clone(),
                zone_id: booking.zone_id.clone(),
                quantity: booking.quantity,
                unit_price_cents: booking.unit_price_cents,
                total_price_cents: booking.unit_price_cents * i64::from(booking.quantity),
                currency: booking.currency.clone(),
                status: BookingStatus::Reserved,
                idempotency_key: booking.idempotency_key.clone(),
                reserved_at: now,
                reservation_expires_at: booking.reservation_expires_at,
                confirmed_at: None,
                confirmation_code: None,
                payment_id: None,
                cancelled_at: None,
                status_reason: None,
                created_at: now,
                updated_at: now,
            };

            state.bookings.insert(booking.id, row.clone());
            row
        };

        self.stage_event(&row, event_types::BOOKING_CREATED).await?;
        Ok(row)
    }

    async fn get_by_id(&self, id: &BookingId) -> Result<Option<Booking>, BookingError> {
        let state = self.lock()?;
        Ok(state.bookings.get(id).cloned())
    }

    async fn get_by_idempotency_key(
        &self,
        user_id: &UserId,
        key: &str,
    ) -> Result<Option<Booking>, BookingError> {
        let state = self.lock()?;
        Ok(state
            .idempotency
            .get(&(user_id.to_string(), key.to_string()))
            .and_then(|id| state.bookings.get(id))
            .cloned())
    }

    async fn get_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, BookingError> {
        let state = self.lock()?;
        let mut rows: Vec<Booking> = state
            .bookings
            .values()
            .filter(|booking| booking.user_id == *user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn confirm(
        &self,
        id: &BookingId,
        payment_id: &str,
        confirmation_code: &str,
    ) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let booking = self.transition(id, |booking| {
            booking.status = BookingStatus::Confirmed;
            booking.payment_id = Some(payment_id.to_string());
            booking.confirmation_code = Some(confirmation_code.to_string());
            booking.confirmed_at = Some(now);
        })?;
        self.stage_event(&booking, event_types::BOOKING_CONFIRMED).await?;
        Ok(booking)
    }

    async fn cancel(&self, id: &BookingId) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let booking = self.transition(id, |booking| {
            booking.status = BookingStatus::Cancelled;
            booking.cancelled_at = Some(now);
        })?;
        self.stage_event(&booking, event_types::BOOKING_CANCELLED).await?;
        Ok(booking)
    }

    async fn mark_expired(&self, id: &BookingId, reason: &str) -> Result<Booking, BookingError> {
        let booking = self.transition(id, |booking| {
            booking.status = BookingStatus::Expired;
            booking.status_reason = Some(reason.to_string());
        })?;
        self.stage_event(&booking, event_types::BOOKING_EXPIRED).await?;
        Ok(booking)
    }

    async fn get_expired_reservations(&self, limit: i64) -> Result<Vec<Booking>, BookingError> {
        let now = self.clock.now();
        let state = self.lock()?;
        let mut rows: Vec<Booking> = state
            .bookings
            .values()
            .filter(|booking| {
                booking.status == BookingStatus::Reserved && booking.reservation_expires_at < now
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.reservation_expires_at.cmp(&b.reservation_expires_at));
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn count_by_user_and_event(
        &self,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<i64, BookingError> {
        let state = self.lock()?;
        Ok(state
            .bookings
            .values()
            .filter(|booking| {
                booking.user_id == *user_id
                    && booking.event_id == *event_id
                    && matches!(
                        booking.status,
                        BookingStatus::Reserved | BookingStatus::Confirmed
                    )
            })
            .count() as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use stampede_core::types::{ShowId, TenantId, ZoneId};

    fn new_booking(user: &str, key: Option<&str>) -> NewBooking {
        NewBooking {
            id: BookingId::new(),
            tenant_id: TenantId::new("t1"),
            user_id: UserId::new(user),
            event_id: EventId::new("e1"),
            show_id: ShowId::new("s1"),
            zone_id: ZoneId::new("vip"),
            quantity: 2,
            unit_price_cents: 5000,
            currency: "USD".to_string(),
            idempotency_key: key.map(str::to_string),
            reservation_expires_at: Utc::now() + Duration::seconds(600),
        }
    }

    #[tokio::test]
    async fn create_computes_total_and_status() {
        let store = InMemoryBookingStore::new();
        let created = store.create(&new_booking("u1", None)).await.unwrap();
        assert_eq!(created.status, BookingStatus::Reserved);
        assert_eq!(created.total_price_cents, 10_000);
    }

    #[tokio::test]
    async fn mutations_stage_their_lifecycle_events() {
        let store = InMemoryBookingStore::new();
        let created = store.create(&new_booking("u1", None)).await.unwrap();
        store.confirm(&created.id, "pay-1", "CODE").await.unwrap();

        let staged: Vec<String> = store
            .outbox()
            .entries()
            .into_iter()
            .map(|entry| entry.event_type)
            .collect();
        assert_eq!(staged, vec!["booking.created", "booking.confirmed"]);

        // A rejected transition stages nothing.
        assert!(store.cancel(&created.id).await.is_err());
        assert_eq!(store.outbox().entries().len(), 2);
    }

    #[tokio::test]
    async fn idempotency_key_is_unique_per_user() {
        let store = InMemoryBookingStore::new();
        store.create(&new_booking("u1", Some("k1"))).await.unwrap();

        let err = store
            .create(&new_booking("u1", Some("k1")))
            .await
            .unwrap_err();
        assert_eq!(err, BookingError::DuplicateIdempotencyKey);

        // A different user may reuse the same key.
        store.create(&new_booking("u2", Some("k1"))).await.unwrap();
    }

    #[tokio::test]
    async fn confirm_is_conditional_on_reserved() {
        let store = InMemoryBookingStore::new();
        let created = store.create(&new_booking("u1", None)).await.unwrap();

        let confirmed = store.confirm(&created.id, "pay-1", "CODE1234").await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.payment_id.as_deref(), Some("pay-1"));
        assert!(confirmed.confirmed_at.is_some());

        assert_eq!(
            store.confirm(&created.id, "pay-2", "CODE5678").await.unwrap_err(),
            BookingError::AlreadyConfirmed
        );
        assert_eq!(
            store.cancel(&created.id).await.unwrap_err(),
            BookingError::AlreadyConfirmed
        );
        assert_eq!(
            store.mark_expired(&created.id, "window elapsed").await.unwrap_err(),
            BookingError::AlreadyConfirmed
        );
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let store = InMemoryBookingStore::new();
        assert_eq!(
            store.cancel(&BookingId::new()).await.unwrap_err(),
            BookingError::NotFound
        );
    }

    #[tokio::test]
    async fn expired_scan_returns_lapsed_reserved_rows_only() {
        let clock = Arc::new(stampede_core::clock::FixedClock::new(Utc::now()));
        let store = InMemoryBookingStore::with_clock(clock.clone());

        let mut lapsing = new_booking("u1", None);
        lapsing.reservation_expires_at = clock.now() + Duration::seconds(5);
        let lapsing = store.create(&lapsing).await.unwrap();

        let mut fresh = new_booking("u1", None);
        fresh.reservation_expires_at = clock.now() + Duration::seconds(600);
        store.create(&fresh).await.unwrap();

        let mut paid = new_booking("u1", None);
        paid.reservation_expires_at = clock.now() + Duration::seconds(5);
        let paid = store.create(&paid).await.unwrap();
        store.confirm(&paid.id, "pay-1", "CODE").await.unwrap();

        clock.advance_secs(10);

        let expired = store.get_expired_reservations(10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, lapsing.id);
    }

    #[tokio::test]
    async fn count_covers_reserved_and_confirmed() {
        let store = InMemoryBookingStore::new();
        let first = store.create(&new_booking("u1", None)).await.unwrap();
        store.create(&new_booking("u1", None)).await.unwrap();
        store.confirm(&first.id, "pay-1", "CODE").await.unwrap();

        let cancelled = store.create(&new_booking("u1", None)).await.unwrap();
        store.cancel(&cancelled.id).await.unwrap();

        assert_eq!(
            store
                .count_by_user_and_event(&UserId::new("u1"), &EventId::new("e1"))
                .await
                .unwrap(),
            2
        );
    }
}
