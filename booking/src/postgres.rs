//! Postgres booking ledger.
//!
//! Schema in `schema.sql` (applied out-of-band). State transitions are a
//! single round trip: the update runs in a CTE and the outer select reads
//! the pre-update row, so a failed transition comes back with the prior
//! status instead of a bare zero-row count.
//!
//! Every mutation stages its lifecycle event in the outbox within the same
//! transaction, so the event is published at least once exactly when the
//! row change committed, and never when it rolled back.

use crate::outbox::{self, NewOutboxEntry};
use crate::store::{BookingError, BookingStore, NewBooking};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use stampede_bus::topics::event_types;
use stampede_core::types::{
    Booking, BookingId, BookingStatus, EventId, ShowId, TenantId, UserId, ZoneId,
};
use uuid::Uuid;

/// Postgres implementation of [`BookingStore`].
pub struct PostgresBookingStore {
    pool: PgPool,
}

impl PostgresBookingStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db_err(e: &sqlx::Error) -> BookingError {
        BookingError::Database(e.to_string())
    }

    fn row_to_booking(row: &PgRow) -> Result<Booking, BookingError> {
        let status_str: String = row.get("status");
        let status = BookingStatus::parse(&status_str)
            .map_err(|e| BookingError::Database(e.to_string()))?;
        let quantity: i32 = row.get("quantity");
        let quantity = u32::try_from(quantity)
            .map_err(|_| BookingError::Database("negative quantity in row".to_string()))?;

        Ok(Booking {
            id: BookingId::from_uuid(row.get("id")),
            tenant_id: TenantId::new(row.get::<String, _>("tenant_id")),
            user_id: UserId::new(row.get::<String, _>("user_id")),
            event_id: EventId::new(row.get::<String, _>("event_id")),
            show_id: ShowId::new(row.get::<String, _>("show_id")),
            zone_id: ZoneId::new(row.get::<String, _>("zone_id")),
            quantity,
            unit_price_cents: row.get("unit_price_cents"),
            total_price_cents: row.get("total_price_cents"),
            currency: row.get("currency"),
            status,
            idempotency_key: row.get("idempotency_key"),
            reserved_at: row.get("reserved_at"),
            reservation_expires_at: row.get("reservation_expires_at"),
            confirmed_at: row.get("confirmed_at"),
            confirmation_code: row.get("confirmation_code"),
            payment_id: row.get("payment_id"),
            cancelled_at: row.get("cancelled_at"),
            status_reason: row.get("status_reason"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Run a conditional `reserved → *` transition and decode the outcome
    /// from the combined prior-status / updated-row result.
    fn decode_transition(row: Option<PgRow>) -> Result<Booking, BookingError> {
        let Some(row) = row else {
            return Err(BookingError::NotFound);
        };
        let updated_id: Option<Uuid> = row.get("id");
        if updated_id.is_none() {
            let prior: String = row.get("prior_status");
            return Err(BookingError::from_prior_status(&prior));
        }
        Self::row_to_booking(&row)
    }

    /// Stage the lifecycle event for a just-written row on the same
    /// transaction.
    async fn stage_event(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        booking: &Booking,
        event_type: &str,
    ) -> Result<(), BookingError> {
        let entry = NewOutboxEntry::booking_event(booking, event_type)
            .map_err(|e| BookingError::Database(e.to_string()))?;
        outbox::stage(&mut **tx, &entry)
            .await
            .map_err(|e| BookingError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BookingStore for PostgresBookingStore {
    async fn create(&self, booking: &NewBooking) -> Result<Booking, BookingError> {
        let total_price_cents = booking.unit_price_cents * i64::from(booking.quantity);

        let mut tx = self.pool.begin().await.map_err(|e| Self::db_err(&e))?;

        let result = sqlx::query(
            r"
            INSERT INTO bookings (
                id, tenant_id, user_id, event_id, show_id, zone_id,
                quantity, unit_price_cents, total_price_cents, currency,
                status, idempotency_key, reserved_at, reservation_expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'reserved', $11, NOW(), $12)
            RETURNING *
            ",
        )
        .bind(booking.id.as_uuid())
        .bind(booking.tenant_id.as_str())
        .bind(booking.user_id.as_str())
        .bind(booking.event_id.as_str())
        .bind(booking.show_id.as_str())
        .bind(booking.zone_id.as_str())
        .bind(i32::try_from(booking.quantity).unwrap_or(i32::MAX))
        .bind(booking.unit_price_cents)
        .bind(total_price_cents)
        .bind(&booking.currency)
        .bind(booking.idempotency_key.as_deref())
        .bind(booking.reservation_expires_at)
        .fetch_one(&mut *tx)
        .await;

        match result {
            Ok(row) => {
                let created = Self::row_to_booking(&row)?;
                Self::stage_event(&mut tx, &created, event_types::BOOKING_CREATED).await?;
                tx.commit().await.map_err(|e| Self::db_err(&e))?;

                metrics::counter!("bookings_created_total").increment(1);
                Ok(created)
            },
            Err(e) => {
                let is_idempotency_conflict = e
                    .as_database_error()
                    .and_then(|db| db.constraint())
                    .is_some_and(|name| name == "bookings_user_idempotency_key");
                if is_idempotency_conflict {
                    Err(BookingError::DuplicateIdempotencyKey)
                } else {
                    Err(Self::db_err(&e))
                }
            },
        }
    }

    async fn get_by_id(&self, id: &BookingId) -> Result<Option<Booking>, BookingError> {
        let row = sqlx::query("SELECT * FROM bookings WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err(&e))?;

        row.as_ref().map(Self::row_to_booking).transpose()
    }

    async fn get_by_idempotency_key(
        &self,
        user_id: &UserId,
        key: &str,
    ) -> Result<Option<Booking>, BookingError> {
        let row = sqlx::query("SELECT * FROM bookings WHERE user_id = $1 AND idempotency_key = $2")
            .bind(user_id.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err(&e))?;

        row.as_ref().map(Self::row_to_booking).transpose()
    }

    async fn get_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, BookingError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM bookings
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(user_id.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        rows.iter().map(Self::row_to_booking).collect()
    }

    async fn confirm(
        &self,
        id: &BookingId,
        payment_id: &str,
        confirmation_code: &str,
    ) -> Result<Booking, BookingError> {
        let mut tx = self.pool.begin().await.map_err(|e| Self::db_err(&e))?;

        let row = sqlx::query(
            r"
            WITH upd AS (
                UPDATE bookings
                   SET status = 'confirmed',
                       payment_id = $2,
                       confirmation_code = $3,
                       confirmed_at = NOW(),
                       updated_at = NOW()
                 WHERE id = $1 AND status = 'reserved'
             RETURNING *
            )
            SELECT b.status AS prior_status, upd.*
              FROM bookings b
              LEFT JOIN upd ON upd.id = b.id
             WHERE b.id = $1
            ",
        )
        .bind(id.as_uuid())
        .bind(payment_id)
        .bind(confirmation_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::db_err(&e))?;

        // A failed transition drops the transaction, rolling the no-op back.
        let booking = Self::decode_transition(row)?;
        Self::stage_event(&mut tx, &booking, event_types::BOOKING_CONFIRMED).await?;
        tx.commit().await.map_err(|e| Self::db_err(&e))?;

        tracing::info!(booking_id = %id, payment_id, "booking confirmed");
        metrics::counter!("bookings_transitions_total", "to" => "confirmed").increment(1);
        Ok(booking)
    }

    async fn cancel(&self, id: &BookingId) -> Result<Booking, BookingError> {
        let mut tx = self.pool.begin().await.map_err(|e| Self::db_err(&e))?;

        let row = sqlx::query(
            r"
            WITH upd AS (
                UPDATE bookings
                   SET status = 'cancelled',
                       cancelled_at = NOW(),
                       updated_at = NOW()
                 WHERE id = $1 AND status = 'reserved'
             RETURNING *
            )
            SELECT b.status AS prior_status, upd.*
              FROM bookings b
              LEFT JOIN upd ON upd.id = b.id
             WHERE b.id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::db_err(&e))?;

        let booking = Self::decode_transition(row)?;
        Self::stage_event(&mut tx, &booking, event_types::BOOKING_CANCELLED).await?;
        tx.commit().await.map_err(|e| Self::db_err(&e))?;

        tracing::info!(booking_id = %id, "booking cancelled");
        metrics::counter!("bookings_transitions_total", "to" => "cancelled").increment(1);
        Ok(booking)
    }

    async fn mark_expired(&self, id: &BookingId, reason: &str) -> Result<Booking, BookingError> {
        let mut tx = self.pool.begin().await.map_err(|e| Self::db_err(&e))?;

        let row = sqlx::query(
            r"
            WITH upd AS (
                UPDATE bookings
                   SET status = 'expired',
                       status_reason = $2,
                       updated_at = NOW()
                 WHERE id = $1 AND status = 'reserved'
             RETURNING *
            )
            SELECT b.status AS prior_status, upd.*
              FROM bookings b
              LEFT JOIN upd ON upd.id = b.id
             WHERE b.id = $1
            ",
        )
        .bind(id.as_uuid())
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::db_err(&e))?;

        let booking = Self::decode_transition(row)?;
        Self::stage_event(&mut tx, &booking, event_types::BOOKING_EXPIRED).await?;
        tx.commit().await.map_err(|e| Self::db_err(&e))?;

        metrics::counter!("bookings_transitions_total", "to" => "expired").increment(1);
        Ok(booking)
    }

    async fn get_expired_reservations(&self, limit: i64) -> Result<Vec<Booking>, BookingError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM bookings
            WHERE status = 'reserved' AND reservation_expires_at < NOW()
            ORDER BY reservation_expires_at ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        rows.iter().map(Self::row_to_booking).collect()
    }

    async fn count_by_user_and_event(
        &self,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<i64, BookingError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM bookings
            WHERE user_id = $1 AND event_id = $2 AND status IN ('reserved', 'confirmed')
            ",
        )
        .bind(user_id.as_str())
        .bind(event_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        Ok(count)
    }
}
