//! Booking endpoints: reserve, confirm, cancel, reads.

use crate::error::AppError;
use crate::identity::{GatewayIdentity, optional_header};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stampede_booking::confirmation;
use stampede_booking::service::ReserveRequest;
use stampede_core::types::{Booking, BookingId, EventId, ShowId, ZoneId};
use uuid::Uuid;

/// Request to reserve seats.
#[derive(Debug, Deserialize)]
pub struct ReserveSeatsRequest {
    /// Sale event.
    pub event_id: String,
    /// Show within the event.
    pub show_id: String,
    /// Zone to reserve from.
    pub zone_id: String,
    /// Seats requested.
    pub quantity: u32,
    /// Client-quoted unit price in minor units; the catalog wins when it
    /// has one.
    #[serde(default)]
    pub unit_price: Option<i64>,
}

/// Response after reserving.
#[derive(Debug, Serialize)]
pub struct ReserveSeatsResponse {
    /// The booking id.
    pub booking_id: Uuid,
    /// Always `reserved` for fresh holds; replays return the stored state.
    pub status: String,
    /// When the unpaid hold lapses.
    pub expires_at: DateTime<Utc>,
    /// Total price in minor units.
    pub total_price: i64,
}

/// Request to confirm a booking after payment.
#[derive(Debug, Deserialize)]
pub struct ConfirmBookingRequest {
    /// Payment id from the payment provider.
    pub payment_id: String,
}

/// Response after confirming.
#[derive(Debug, Serialize)]
pub struct ConfirmBookingResponse {
    /// Always `confirmed` on 200.
    pub status: String,
    /// Human-facing confirmation code.
    pub confirmation_code: String,
}

/// A booking, as serialized for reads.
#[derive(Debug, Serialize)]
pub struct BookingResponse {
    /// Booking id.
    pub booking_id: Uuid,
    /// Sale event.
    pub event_id: String,
    /// Show within the event.
    pub show_id: String,
    /// Zone.
    pub zone_id: String,
    /// Seats held.
    pub quantity: u32,
    /// Total price in minor units.
    pub total_price: i64,
    /// Currency code.
    pub currency: String,
    /// Lifecycle status.
    pub status: String,
    /// When the unpaid hold lapses.
    pub expires_at: DateTime<Utc>,
    /// Confirmation code, once confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_code: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

impl BookingResponse {
    fn from_booking(booking: &Booking) -> Self {
        Self {
            booking_id: *booking.id.as_uuid(),
            event_id: booking.event_id.to_string(),
            show_id: booking.show_id.to_string(),
            zone_id: booking.zone_id.to_string(),
            quantity: booking.quantity,
            total_price: booking.total_price_cents,
            currency: booking.currency.clone(),
            status: booking.status.as_str().to_string(),
            expires_at: booking.reservation_expires_at,
            confirmation_code: booking.confirmation_code.clone(),
            created_at: booking.created_at,
        }
    }
}

/// Pagination query for booking lists.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Page size (default 20, capped at 100).
    #[serde(default)]
    pub limit: Option<i64>,
    /// Page offset.
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Booking list response.
#[derive(Debug, Serialize)]
pub struct ListBookingsResponse {
    /// The page of bookings, newest first.
    pub bookings: Vec<BookingResponse>,
}

fn parse_booking_id(raw: &str) -> Result<BookingId, AppError> {
    Uuid::parse_str(raw)
        .map(BookingId::from_uuid)
        .map_err(|_| AppError::bad_request("booking id must be a UUID"))
}

/// POST /bookings/reserve
pub async fn reserve(
    identity: GatewayIdentity,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReserveSeatsRequest>,
) -> Result<(StatusCode, Json<ReserveSeatsResponse>), AppError> {
    let reserved = state
        .reservations
        .reserve(ReserveRequest {
            tenant_id: identity.tenant_id,
            user_id: identity.user_id,
            event_id: EventId::new(request.event_id),
            show_id: ShowId::new(request.show_id),
            zone_id: ZoneId::new(request.zone_id),
            quantity: request.quantity,
            unit_price_cents: request.unit_price,
            idempotency_key: optional_header(&headers, "X-Idempotency-Key"),
            queue_pass: optional_header(&headers, "X-Queue-Pass"),
        })
        .await?;

    let booking = &reserved.booking;
    let status = if reserved.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(ReserveSeatsResponse {
            booking_id: *booking.id.as_uuid(),
            status: booking.status.as_str().to_string(),
            expires_at: booking.reservation_expires_at,
            total_price: booking.total_price_cents,
        }),
    ))
}

/// POST /bookings/{id}/confirm
///
/// Synchronous confirm path for payment callbacks; the saga's confirm
/// worker runs the same idempotent routine, so whichever arrives first
/// wins and the other converges.
pub async fn confirm(
    identity: GatewayIdentity,
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ConfirmBookingRequest>,
) -> Result<Json<ConfirmBookingResponse>, AppError> {
    let booking_id = parse_booking_id(&booking_id)?;
    if request.payment_id.is_empty() {
        return Err(AppError::bad_request("payment_id is required"));
    }

    // Scope to the owner before mutating anything.
    let owned = state
        .bookings
        .get_by_id(&booking_id)
        .await
        .map_err(AppError::from)?
        .filter(|booking| booking.user_id == identity.user_id);
    if owned.is_none() {
        return Err(AppError::not_found("booking"));
    }

    let booking = confirmation::confirm_booking(
        &state.bookings,
        &state.inventory,
        &state.queue,
        &booking_id,
        &identity.user_id,
        &request.payment_id,
    )
    .await?;

    Ok(Json(ConfirmBookingResponse {
        status: booking.status.as_str().to_string(),
        confirmation_code: booking.confirmation_code.unwrap_or_default(),
    }))
}

/// DELETE /bookings/{id}
pub async fn cancel(
    identity: GatewayIdentity,
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking_id = parse_booking_id(&booking_id)?;
    let cancelled = state
        .reservations
        .cancel(&booking_id, &identity.user_id)
        .await?;

    Ok(Json(BookingResponse::from_booking(&cancelled)))
}

/// GET /bookings/{id}
pub async fn get_booking(
    identity: GatewayIdentity,
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking_id = parse_booking_id(&booking_id)?;
    let booking = state
        .reservations
        .get_booking(&booking_id, &identity.user_id)
        .await?
        .ok_or_else(|| AppError::not_found("booking"))?;

    Ok(Json(BookingResponse::from_booking(&booking)))
}

/// GET /bookings?limit=&offset=
pub async fn list_bookings(
    identity: GatewayIdentity,
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> Result<Json<ListBookingsResponse>, AppError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let bookings = state
        .reservations
        .list_bookings(&identity.user_id, limit, offset)
        .await?;

    Ok(Json(ListBookingsResponse {
        bookings: bookings.iter().map(BookingResponse::from_booking).collect(),
    }))
}
