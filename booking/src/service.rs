//! The reservation service: one reserve request, end to end.
//!
//! The flow, in order: input validation, idempotency replay, queue-pass
//! validation, price/cap resolution, atomic seat reservation, and the
//! ledger write (with a best-effort seat release if the write fails),
//! then pass consumption. The `booking.created` event is staged in the
//! outbox inside the ledger transaction and delivered by the relay, so
//! the HTTP response never waits on the event bus.

use crate::catalog::{Catalog, CatalogError};
use crate::store::{BookingError, BookingStore, NewBooking};
use chrono::Duration;
use stampede_core::clock::Clock;
use stampede_core::failure::{Classified, FailureKind};
use stampede_core::types::{Booking, BookingId, EventId, ShowId, TenantId, UserId, ZoneId};
use stampede_inventory::{InventoryError, InventoryStore, ReserveParams};
use stampede_queue::{QueueController, QueueError};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the reservation path.
#[derive(Error, Debug)]
pub enum ReservationError {
    /// Missing or malformed request fields.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The event requires a queue pass and none was presented.
    #[error("queue pass required")]
    QueuePassRequired,

    /// The presented queue pass failed validation.
    #[error("invalid queue pass")]
    InvalidQueuePass,

    /// The catalog has no price for the requested zone.
    #[error("zone not found in catalog")]
    UnknownZone,

    /// The catalog could not be reached.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Inventory engine rejection or fault.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Booking ledger fault.
    #[error(transparent)]
    Store(#[from] BookingError),

    /// Queue store fault while validating or consuming the pass.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ReservationError {
    /// Stable error code surfaced to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::QueuePassRequired => "QUEUE_PASS_REQUIRED",
            Self::InvalidQueuePass => "INVALID_QUEUE_PASS",
            Self::UnknownZone => "ZONE_NOT_FOUND",
            Self::Catalog(_) => "CATALOG_UNAVAILABLE",
            Self::Inventory(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::Queue(e) => e.code(),
        }
    }
}

impl Classified for ReservationError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidInput(_) => FailureKind::Validation,
            Self::QueuePassRequired | Self::InvalidQueuePass => FailureKind::Unauthorized,
            Self::UnknownZone => FailureKind::NotFound,
            Self::Catalog(_) => FailureKind::Retryable,
            Self::Inventory(e) => e.failure_kind(),
            Self::Store(e) => e.failure_kind(),
            Self::Queue(e) => e.failure_kind(),
        }
    }
}

/// A reserve request, as assembled by the transport layer.
#[derive(Clone, Debug)]
pub struct ReserveRequest {
    /// Owning tenant (from the gateway identity headers).
    pub tenant_id: TenantId,
    /// Purchasing user (from the gateway identity headers).
    pub user_id: UserId,
    /// Sale event.
    pub event_id: EventId,
    /// Show within the event.
    pub show_id: ShowId,
    /// Zone to reserve from.
    pub zone_id: ZoneId,
    /// Seats requested.
    pub quantity: u32,
    /// Client-quoted unit price; used only when the catalog has no price.
    pub unit_price_cents: Option<i64>,
    /// Idempotency key from `X-Idempotency-Key`.
    pub idempotency_key: Option<String>,
    /// Queue pass from `X-Queue-Pass`.
    pub queue_pass: Option<String>,
}

/// Result of a reserve call.
#[derive(Clone, Debug)]
pub struct ReservedBooking {
    /// The booking row (stored or replayed).
    pub booking: Booking,
    /// True when an idempotency replay returned an existing booking.
    pub replayed: bool,
}

/// Tunables for the reservation path.
#[derive(Clone, Debug)]
pub struct ReservationConfig {
    /// Reservation window in seconds (default 600).
    pub reservation_ttl_seconds: u64,
    /// Per-user cap when the catalog has none (default 4).
    pub default_max_per_user: u32,
    /// Currency stamped on bookings (default "USD").
    pub currency: String,
    /// Deadline for inventory-store calls on the hot path (default 500 ms).
    pub inventory_deadline: std::time::Duration,
    /// Deadline for ledger writes on the hot path (default 1 s).
    pub database_deadline: std::time::Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_seconds: 600,
            default_max_per_user: 4,
            currency: "USD".to_string(),
            inventory_deadline: std::time::Duration::from_millis(500),
            database_deadline: std::time::Duration::from_secs(1),
        }
    }
}

/// Orchestrates a single reserve request.
pub struct ReservationService {
    bookings: Arc<dyn BookingStore>,
    inventory: Arc<dyn InventoryStore>,
    queue: Arc<QueueController>,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    config: ReservationConfig,
}

impl ReservationService {
    /// Wire up the service.
    #[must_use]
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        inventory: Arc<dyn InventoryStore>,
        queue: Arc<QueueController>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
        config: ReservationConfig,
    ) -> Self {
        Self {
            bookings,
            inventory,
            queue,
            catalog,
            clock,
            config,
        }
    }

    /// Reserve seats.
    ///
    /// # Errors
    ///
    /// See [`ReservationError`]; inventory rejections pass through with
    /// their engine codes.
    pub async fn reserve(
        &self,
        request: ReserveRequest,
    ) -> Result<ReservedBooking, ReservationError> {
        // 1. Validate.
        if request.user_id.is_empty() || request.event_id.is_empty() || request.zone_id.is_empty()
        {
            return Err(ReservationError::InvalidInput(
                "user_id, event_id, and zone_id are required".to_string(),
            ));
        }
        if request.quantity < 1 {
            return Err(ReservationError::InvalidInput(
                "quantity must be at least 1".to_string(),
            ));
        }

        // 2. Idempotency replay: return the stored booking unchanged, even
        //    if it has since expired.
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self
                .bookings
                .get_by_idempotency_key(&request.user_id, key)
                .await?
            {
                tracing::debug!(
                    booking_id = %existing.id,
                    idempotency_key = %key,
                    "idempotent replay, returning stored booking"
                );
                metrics::counter!("reservations_total", "outcome" => "replayed").increment(1);
                return Ok(ReservedBooking {
                    booking: existing,
                    replayed: true,
                });
            }
        }

        // 3. Queue-pass enforcement.
        let pass_required = self.catalog.queue_pass_required(&request.event_id).await?;
        if pass_required {
            let Some(pass) = &request.queue_pass else {
                return Err(ReservationError::QueuePassRequired);
            };
            if !self
                .queue
                .validate_pass(&request.event_id, &request.user_id, pass)
                .await?
            {
                return Err(ReservationError::InvalidQueuePass);
            }
        }

        // 4. Resolve price and cap. The catalog is authoritative; the
        //    client-quoted price only fills a catalog gap.
        let unit_price_cents = match self
            .catalog
            .zone_unit_price_cents(&request.event_id, &request.zone_id)
            .await?
        {
            Some(cents) => cents,
            None => request.unit_price_cents.ok_or(ReservationError::UnknownZone)?,
        };
        let max_per_user = self
            .catalog
            .max_per_user(&request.event_id)
            .await?
            .unwrap_or(self.config.default_max_per_user);

        // 5. Generate the booking id outside the engine.
        let booking_id = BookingId::new();

        // 6. Atomic reserve; any engine rejection stops the flow with no
        //    ledger row written. A deadline overrun surfaces as a retryable
        //    store fault.
        tokio::time::timeout(
            self.config.inventory_deadline,
            self.inventory.reserve_seats(&ReserveParams {
                booking_id,
                zone_id: request.zone_id.clone(),
                user_id: request.user_id.clone(),
                event_id: request.event_id.clone(),
                quantity: request.quantity,
                max_per_user,
                unit_price_cents,
                ttl_seconds: self.config.reservation_ttl_seconds,
            }),
        )
        .await
        .map_err(|_| InventoryError::Store("inventory call timed out".to_string()))??;

        // 7. Durable write; on failure the seat hold is rolled back.
        let expires_at = self.clock.now()
            + Duration::seconds(
                i64::try_from(self.config.reservation_ttl_seconds).unwrap_or(600),
            );
        let new_booking = NewBooking {
            id: booking_id,
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            event_id: request.event_id.clone(),
            show_id: request.show_id.clone(),
            zone_id: request.zone_id.clone(),
            quantity: request.quantity,
            unit_price_cents,
            currency: self.config.currency.clone(),
            idempotency_key: request.idempotency_key.clone(),
            reservation_expires_at: expires_at,
        };

        let create_result = tokio::time::timeout(
            self.config.database_deadline,
            self.bookings.create(&new_booking),
        )
        .await
        .unwrap_or_else(|_| Err(BookingError::Database("ledger write timed out".to_string())));

        let booking = match create_result {
            Ok(booking) => booking,
            Err(BookingError::DuplicateIdempotencyKey) => {
                // A concurrent request with the same key won the insert;
                // drop our hold and replay theirs.
                self.rollback_reserve(&booking_id, &request.user_id).await;
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .bookings
                    .get_by_idempotency_key(&request.user_id, key)
                    .await?
                    .ok_or(BookingError::DuplicateIdempotencyKey)?;
                return Ok(ReservedBooking {
                    booking: existing,
                    replayed: true,
                });
            },
            Err(error) => {
                self.rollback_reserve(&booking_id, &request.user_id).await;
                return Err(error.into());
            },
        };

        // 8. Consume the pass; the booking stands even if this fails.
        if let Err(error) = self
            .queue
            .delete_pass(&request.event_id, &request.user_id)
            .await
        {
            tracing::warn!(
                booking_id = %booking.id,
                error = %error,
                "failed to delete queue pass after booking"
            );
        }

        // 9. booking.created was staged in the outbox inside the ledger
        //    transaction; the relay publishes it. The response never waits
        //    on the bus.
        metrics::counter!("reservations_total", "outcome" => "reserved").increment(1);
        tracing::info!(
            booking_id = %booking.id,
            user_id = %booking.user_id,
            zone_id = %booking.zone_id,
            quantity = booking.quantity,
            "booking reserved"
        );

        Ok(ReservedBooking {
            booking,
            replayed: false,
        })
    }

    /// Cancel a `reserved` booking on behalf of its owner: release the seat
    /// hold and flip the ledger row (which stages `booking.cancelled`).
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for unknown ids or foreign owners,
    /// [`BookingError::AlreadyConfirmed`] / `AlreadyCancelled` /
    /// `AlreadyExpired` for wrong-state rows, or transport faults.
    pub async fn cancel(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
    ) -> Result<Booking, ReservationError> {
        let booking = self
            .bookings
            .get_by_id(booking_id)
            .await?
            .ok_or(BookingError::NotFound)?;
        if booking.user_id != *user_id {
            // Foreign bookings are indistinguishable from absent ones.
            return Err(BookingError::NotFound.into());
        }

        match self.inventory.release_seats(booking_id, user_id).await {
            // TTL already dropped the hold; the ledger row is still ours to flip.
            Ok(_) | Err(InventoryError::ReservationNotFound) => {},
            Err(error) => return Err(error.into()),
        }

        let cancelled = self.bookings.cancel(booking_id).await?;
        metrics::counter!("reservations_total", "outcome" => "cancelled").increment(1);
        Ok(cancelled)
    }

    /// Fetch a booking, scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    pub async fn get_booking(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
    ) -> Result<Option<Booking>, ReservationError> {
        let booking = self.bookings.get_by_id(booking_id).await?;
        Ok(booking.filter(|b| b.user_id == *user_id))
    }

    /// Page through a user's bookings.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] on transport faults.
    pub async fn list_bookings(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, ReservationError> {
        Ok(self.bookings.get_by_user(user_id, limit, offset).await?)
    }

    /// Best-effort seat release after a failed ledger write. A hold that
    /// cannot be released raises an operational alert and is left for the
    /// reservation TTL.
    async fn rollback_reserve(&self, booking_id: &BookingId, user_id: &UserId) {
        if let Err(error) = self.inventory.release_seats(booking_id, user_id).await {
            tracing::error!(
                booking_id = %booking_id,
                error = %error,
                "CRITICAL: failed to roll back seat hold after ledger write failure; \
                 orphan hold will be reclaimed by TTL"
            );
            metrics::counter!("reservations_rollback_failures_total").increment(1);
        }
    }
}
