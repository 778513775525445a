//! Redis-backed inventory engine.
//!
//! Each operation is one Lua script, evaluated atomically by Redis's
//! single-threaded command loop. The scripts embed the key layout from
//! [`crate::keys`]; [`RESERVATION_TTL_GRACE_SECONDS`] keeps the reservation
//! record alive slightly past the durable expiry so the expiration sweeper
//! can still load it to reconcile counters, with the TTL acting as the
//! safety net if the sweeper is down.

use crate::keys;
use crate::store::{
    ConfirmOutcome, InventoryError, InventoryStore, ReleaseOutcome, ReservationRecord,
    ReservationState, ReserveOutcome, ReserveParams,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use stampede_core::types::{BookingId, EventId, UserId, ZoneId};
use std::collections::HashMap;

/// Extra seconds a reservation record lives past the reservation window.
///
/// The durable booking row expires at `reserved_at + ttl`; the sweeper then
/// needs the record to still be loadable to return the seats. Sized to
/// comfortably cover several sweep intervals.
pub const RESERVATION_TTL_GRACE_SECONDS: u64 = 30;

/// Reserve: validate, decrement zone, increment user counter, create record.
///
/// Returns `{code, remaining, user_reserved}`.
const RESERVE_SCRIPT: &str = r"
local zone_key = KEYS[1]
local user_key = KEYS[2]
local reservation_key = KEYS[3]
local quantity = tonumber(ARGV[1])
local max_per_user = tonumber(ARGV[2])
local ttl_seconds = tonumber(ARGV[3])
local user_id = ARGV[4]
local event_id = ARGV[5]
local zone_id = ARGV[6]
local unit_price = ARGV[7]
local created_at = ARGV[8]

if quantity < 1 then
    return {'INVALID_QUANTITY', 0, 0}
end
local available = redis.call('GET', zone_key)
if not available then
    return {'ZONE_NOT_FOUND', 0, 0}
end
available = tonumber(available)
local reserved = tonumber(redis.call('GET', user_key) or '0')
if reserved + quantity > max_per_user then
    return {'USER_LIMIT_EXCEEDED', available, reserved}
end
if available < quantity then
    return {'INSUFFICIENT_STOCK', available, reserved}
end
redis.call('DECRBY', zone_key, quantity)
local new_reserved = redis.call('INCRBY', user_key, quantity)
redis.call('EXPIRE', user_key, ttl_seconds)
redis.call('HSET', reservation_key,
    'user_id', user_id,
    'event_id', event_id,
    'zone_id', zone_id,
    'quantity', quantity,
    'unit_price', unit_price,
    'status', 'pending',
    'created_at', created_at)
redis.call('EXPIRE', reservation_key, ttl_seconds)
return {'OK', available - quantity, new_reserved}
";

/// Confirm: stamp payment, flip to confirmed, make the record permanent.
///
/// Returns `{code, confirmed_at}`.
const CONFIRM_SCRIPT: &str = r"
local reservation_key = KEYS[1]
local user_id = ARGV[1]
local payment_id = ARGV[2]
local confirmed_at = ARGV[3]

if redis.call('EXISTS', reservation_key) == 0 then
    return {'RESERVATION_NOT_FOUND', ''}
end
if redis.call('HGET', reservation_key, 'user_id') ~= user_id then
    return {'USER_MISMATCH', ''}
end
if redis.call('HGET', reservation_key, 'status') == 'confirmed' then
    return {'ALREADY_CONFIRMED', ''}
end
redis.call('HSET', reservation_key,
    'status', 'confirmed',
    'payment_id', payment_id,
    'confirmed_at', confirmed_at)
redis.call('PERSIST', reservation_key)
return {'OK', confirmed_at}
";

/// Release: return seats, decrement user counter (floored at 0), delete record.
///
/// Derives the zone and user-counter keys from the record's own fields; the
/// literals must match [`crate::keys`].
///
/// Returns `{code, remaining, user_reserved}`.
const RELEASE_SCRIPT: &str = r"
local reservation_key = KEYS[1]
local user_id = ARGV[1]

if redis.call('EXISTS', reservation_key) == 0 then
    return {'RESERVATION_NOT_FOUND', 0, 0}
end
if redis.call('HGET', reservation_key, 'user_id') ~= user_id then
    return {'USER_MISMATCH', 0, 0}
end
if redis.call('HGET', reservation_key, 'status') == 'confirmed' then
    return {'ALREADY_CONFIRMED', 0, 0}
end
local quantity = tonumber(redis.call('HGET', reservation_key, 'quantity'))
local zone_id = redis.call('HGET', reservation_key, 'zone_id')
local event_id = redis.call('HGET', reservation_key, 'event_id')
local zone_key = 'zone:availability:' .. zone_id
local user_key = 'user:reservations:' .. user_id .. ':' .. event_id

local remaining = redis.call('INCRBY', zone_key, quantity)
local reserved = tonumber(redis.call('GET', user_key) or '0')
local user_reserved = 0
if reserved > quantity then
    user_reserved = redis.call('DECRBY', user_key, quantity)
else
    redis.call('DEL', user_key)
end
redis.call('DEL', reservation_key)
return {'OK', remaining, user_reserved}
";

/// Redis implementation of [`InventoryStore`].
///
/// Connection pooling via [`ConnectionManager`]; scripts are loaded once and
/// invoked by hash afterwards.
#[derive(Clone)]
pub struct RedisInventoryStore {
    conn_manager: ConnectionManager,
    reserve_script: Script,
    confirm_script: Script,
    release_script: Script,
}

impl RedisInventoryStore {
    /// Create a new Redis inventory store.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] if the connection cannot be
    /// established.
    pub async fn new(redis_url: &str) -> Result<Self, InventoryError> {
        let client = Client::open(redis_url)
            .map_err(|e| InventoryError::Store(format!("failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            InventoryError::Store(format!("failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self {
            conn_manager,
            reserve_script: Script::new(RESERVE_SCRIPT),
            confirm_script: Script::new(CONFIRM_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    fn store_err(context: &str, e: &redis::RedisError) -> InventoryError {
        InventoryError::Store(format!("{context}: {e}"))
    }
}

#[async_trait]
impl InventoryStore for RedisInventoryStore {
    async fn seed_zone(&self, zone_id: &ZoneId, seats: u32) -> Result<(), InventoryError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .set(keys::zone_availability(zone_id), i64::from(seats))
            .await
            .map_err(|e| Self::store_err("failed to seed zone", &e))?;

        tracing::info!(zone_id = %zone_id, seats, "seeded zone availability");
        Ok(())
    }

    async fn retire_zone(&self, zone_id: &ZoneId) -> Result<(), InventoryError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(keys::zone_availability(zone_id))
            .await
            .map_err(|e| Self::store_err("failed to retire zone", &e))?;

        tracing::info!(zone_id = %zone_id, "retired zone");
        Ok(())
    }

    async fn zone_availability(&self, zone_id: &ZoneId) -> Result<Option<i64>, InventoryError> {
        let mut conn = self.conn_manager.clone();
        conn.get(keys::zone_availability(zone_id))
            .await
            .map_err(|e| Self::store_err("failed to read zone availability", &e))
    }

    async fn user_reserved(
        &self,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<i64, InventoryError> {
        let mut conn = self.conn_manager.clone();
        let count: Option<i64> = conn
            .get(keys::user_reservations(user_id, event_id))
            .await
            .map_err(|e| Self::store_err("failed to read user reservations", &e))?;
        Ok(count.unwrap_or(0))
    }

    async fn reserve_seats(
        &self,
        params: &ReserveParams,
    ) -> Result<ReserveOutcome, InventoryError> {
        let mut conn = self.conn_manager.clone();
        let ttl_with_grace = params.ttl_seconds + RESERVATION_TTL_GRACE_SECONDS;

        let (code, remaining, user_reserved): (String, i64, i64) = self
            .reserve_script
            .key(keys::zone_availability(&params.zone_id))
            .key(keys::user_reservations(&params.user_id, &params.event_id))
            .key(keys::reservation(&params.booking_id))
            .arg(params.quantity)
            .arg(params.max_per_user)
            .arg(ttl_with_grace)
            .arg(params.user_id.as_str())
            .arg(params.event_id.as_str())
            .arg(params.zone_id.as_str())
            .arg(params.unit_price_cents)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("reserve script failed", &e))?;

        if code == "OK" {
            tracing::debug!(
                booking_id = %params.booking_id,
                zone_id = %params.zone_id,
                quantity = params.quantity,
                remaining,
                user_reserved,
                "seats reserved"
            );
            metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                .increment(1);
            Ok(ReserveOutcome {
                remaining,
                user_reserved,
            })
        } else {
            metrics::counter!("inventory_reservations_total", "outcome" => "rejected")
                .increment(1);
            Err(InventoryError::from_code(&code)
                .unwrap_or_else(|| InventoryError::Store(format!("unknown script code: {code}"))))
        }
    }

    async fn confirm_booking(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
        payment_id: &str,
    ) -> Result<ConfirmOutcome, InventoryError> {
        let mut conn = self.conn_manager.clone();
        let confirmed_at = Utc::now();

        let (code, _stamp): (String, String) = self
            .confirm_script
            .key(keys::reservation(booking_id))
            .arg(user_id.as_str())
            .arg(payment_id)
            .arg(confirmed_at.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("confirm script failed", &e))?;

        if code == "OK" {
            tracing::debug!(booking_id = %booking_id, payment_id, "reservation confirmed");
            Ok(ConfirmOutcome { confirmed_at })
        } else {
            Err(InventoryError::from_code(&code)
                .unwrap_or_else(|| InventoryError::Store(format!("unknown script code: {code}"))))
        }
    }

    async fn release_seats(
        &self,
        booking_id: &BookingId,
        user_id: &UserId,
    ) -> Result<ReleaseOutcome, InventoryError> {
        let mut conn = self.conn_manager.clone();

        let (code, remaining, user_reserved): (String, i64, i64) = self
            .release_script
            .key(keys::reservation(booking_id))
            .arg(user_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("release script failed", &e))?;

        if code == "OK" {
            tracing::debug!(booking_id = %booking_id, remaining, "seats released");
            metrics::counter!("inventory_releases_total").increment(1);
            Ok(ReleaseOutcome {
                remaining,
                user_reserved,
            })
        } else {
            Err(InventoryError::from_code(&code)
                .unwrap_or_else(|| InventoryError::Store(format!("unknown script code: {code}"))))
        }
    }

    async fn get_reservation(
        &self,
        booking_id: &BookingId,
    ) -> Result<Option<ReservationRecord>, InventoryError> {
        let mut conn = self.conn_manager.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(keys::reservation(booking_id))
            .await
            .map_err(|e| Self::store_err("failed to read reservation", &e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let get = |name: &str| -> Result<String, InventoryError> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| InventoryError::Store(format!("reservation missing field {name}")))
        };

        let status = match get("status")?.as_str() {
            "confirmed" => ReservationState::Confirmed,
            _ => ReservationState::Pending,
        };
        let quantity: u32 = get("quantity")?
            .parse()
            .map_err(|_| InventoryError::Store("reservation quantity unparseable".to_string()))?;
        let unit_price_cents: i64 = get("unit_price")?
            .parse()
            .map_err(|_| InventoryError::Store("reservation price unparseable".to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&get("created_at")?)
            .map_err(|_| InventoryError::Store("reservation timestamp unparseable".to_string()))?
            .with_timezone(&Utc);

        Ok(Some(ReservationRecord {
            booking_id: *booking_id,
            user_id: UserId::new(get("user_id")?),
            event_id: EventId::new(get("event_id")?),
            zone_id: ZoneId::new(get("zone_id")?),
            quantity,
            unit_price_cents,
            status,
            created_at,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // These tests require a running Redis instance:
    // docker run -d -p 6379:6379 redis:7-alpine

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn reserve_confirm_lifecycle() {
        let store = RedisInventoryStore::new("redis://127.0.0.1:6379")
            .await
            .unwrap();

        let zone = ZoneId::new(format!("test-zone-{}", uuid::Uuid::new_v4()));
        store.seed_zone(&zone, 10).await.unwrap();

        let params = ReserveParams {
            booking_id: BookingId::new(),
            zone_id: zone.clone(),
            user_id: UserId::new("u1"),
            event_id: EventId::new("e1"),
            quantity: 3,
            max_per_user: 4,
            unit_price_cents: 5000,
            ttl_seconds: 60,
        };

        let outcome = store.reserve_seats(&params).await.unwrap();
        assert_eq!(outcome.remaining, 7);
        assert_eq!(outcome.user_reserved, 3);

        let record = store
            .get_reservation(&params.booking_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ReservationState::Pending);
        assert_eq!(record.quantity, 3);

        store
            .confirm_booking(&params.booking_id, &params.user_id, "pay-1")
            .await
            .unwrap();

        // Confirmed reservations reject release.
        let err = store
            .release_seats(&params.booking_id, &params.user_id)
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::AlreadyConfirmed);

        store.retire_zone(&zone).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn release_restores_counters() {
        let store = RedisInventoryStore::new("redis://127.0.0.1:6379")
            .await
            .unwrap();

        let zone = ZoneId::new(format!("test-zone-{}", uuid::Uuid::new_v4()));
        store.seed_zone(&zone, 5).await.unwrap();

        let params = ReserveParams {
            booking_id: BookingId::new(),
            zone_id: zone.clone(),
            user_id: UserId::new("u1"),
            event_id: EventId::new("e1"),
            quantity: 2,
            max_per_user: 4,
            unit_price_cents: 5000,
            ttl_seconds: 60,
        };

        store.reserve_seats(&params).await.unwrap();
        let outcome = store
            .release_seats(&params.booking_id, &params.user_id)
            .await
            .unwrap();
        assert_eq!(outcome.remaining, 5);
        assert_eq!(outcome.user_reserved, 0);

        assert!(
            store
                .get_reservation(&params.booking_id)
                .await
                .unwrap()
                .is_none()
        );

        store.retire_zone(&zone).await.unwrap();
    }
}
