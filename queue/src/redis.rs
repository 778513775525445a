//! Redis-backed queue store.
//!
//! Join and leave are Lua scripts so the membership check, the size cap,
//! and the writes commit together; Redis's command loop makes join order
//! the total order. `pop_front` leans on `ZPOPMIN`, which is atomic on its
//! own.

use crate::keys;
use crate::store::{EventQueueConfig, JoinOutcome, QueueError, QueuePosition, QueueStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use stampede_core::types::{EventId, UserId};
use std::collections::HashMap;

/// Upper bound on keys visited when counting outstanding passes.
const PASS_SCAN_BOUND: u64 = 10_000;

/// Join: reject members and full queues, then add with a server-clock score.
///
/// `TIME` is non-deterministic, so the script opts into effects replication
/// before touching the clock. Ties on the score resolve by member order,
/// stable within a boot.
///
/// Returns `{code, position, total, joined_at}`.
const JOIN_SCRIPT: &str = r"
redis.replicate_commands()
local queue_key = KEYS[1]
local user_info_key = KEYS[2]
local user_id = ARGV[1]
local token = ARGV[2]
local ttl_seconds = tonumber(ARGV[3])
local max_queue_size = tonumber(ARGV[4])

local rank = redis.call('ZRANK', queue_key, user_id)
if rank ~= false then
    return {'ALREADY_IN_QUEUE', rank + 1, redis.call('ZCARD', queue_key), ''}
end
local total = redis.call('ZCARD', queue_key)
if max_queue_size > 0 and total >= max_queue_size then
    return {'QUEUE_FULL', 0, total, ''}
end

local t = redis.call('TIME')
local joined_at = tonumber(t[1]) + tonumber(t[2]) / 1000000
redis.call('ZADD', queue_key, joined_at, user_id)
redis.call('HSET', user_info_key,
    'user_id', user_id,
    'token', token,
    'joined_at', tostring(joined_at))
redis.call('EXPIRE', user_info_key, ttl_seconds)

local new_rank = redis.call('ZRANK', queue_key, user_id)
return {'OK', new_rank + 1, redis.call('ZCARD', queue_key), tostring(joined_at)}
";

/// Leave: token-checked removal from the set and the info hash.
///
/// Returns `{code}`.
const LEAVE_SCRIPT: &str = r"
local queue_key = KEYS[1]
local user_info_key = KEYS[2]
local user_id = ARGV[1]
local token = ARGV[2]

if redis.call('ZSCORE', queue_key, user_id) == false then
    return {'NOT_IN_QUEUE'}
end
local stored = redis.call('HGET', user_info_key, 'token')
if stored == false or stored ~= token then
    return {'INVALID_QUEUE_TOKEN'}
end
redis.call('ZREM', queue_key, user_id)
redis.call('DEL', user_info_key)
return {'OK'}
";

/// Redis implementation of [`QueueStore`].
#[derive(Clone)]
pub struct RedisQueueStore {
    conn_manager: ConnectionManager,
    join_script: Script,
    leave_script: Script,
}

impl RedisQueueStore {
    /// Create a new Redis queue store.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the connection cannot be established.
    pub async fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)
            .map_err(|e| QueueError::Store(format!("failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            QueueError::Store(format!("failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self {
            conn_manager,
            join_script: Script::new(JOIN_SCRIPT),
            leave_script: Script::new(LEAVE_SCRIPT),
        })
    }

    fn store_err(context: &str, e: &redis::RedisError) -> QueueError {
        QueueError::Store(format!("{context}: {e}"))
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn join(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
        ttl_seconds: u64,
        max_queue_size: u64,
    ) -> Result<JoinOutcome, QueueError> {
        let mut conn = self.conn_manager.clone();

        let (code, position, total, joined_at): (String, u64, u64, String) = self
            .join_script
            .key(keys::queue(event_id))
            .key(keys::user_info(event_id, user_id))
            .arg(user_id.as_str())
            .arg(token)
            .arg(ttl_seconds)
            .arg(max_queue_size)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("join script failed", &e))?;

        match code.as_str() {
            "OK" => {
                tracing::debug!(event_id = %event_id, user_id = %user_id, position, total, "joined queue");
                metrics::counter!("queue_joins_total", "outcome" => "joined").increment(1);
                Ok(JoinOutcome {
                    position,
                    total,
                    joined_at: joined_at.parse().unwrap_or_default(),
                })
            },
            "ALREADY_IN_QUEUE" => Err(QueueError::AlreadyInQueue { position }),
            "QUEUE_FULL" => {
                metrics::counter!("queue_joins_total", "outcome" => "full").increment(1);
                Err(QueueError::QueueFull)
            },
            other => Err(QueueError::Store(format!("unknown script code: {other}"))),
        }
    }

    async fn position(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<QueuePosition, QueueError> {
        let mut conn = self.conn_manager.clone();
        let queue_key = keys::queue(event_id);

        let (rank, total): (Option<u64>, u64) = redis::pipe()
            .zrank(&queue_key, user_id.as_str())
            .zcard(&queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("failed to read position", &e))?;

        Ok(QueuePosition {
            position: rank.map(|r| r + 1),
            total,
        })
    }

    async fn leave(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();

        let (code,): (String,) = self
            .leave_script
            .key(keys::queue(event_id))
            .key(keys::user_info(event_id, user_id))
            .arg(user_id.as_str())
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("leave script failed", &e))?;

        match code.as_str() {
            "OK" => {
                tracing::debug!(event_id = %event_id, user_id = %user_id, "left queue");
                Ok(())
            },
            "NOT_IN_QUEUE" => Err(QueueError::NotInQueue),
            "INVALID_QUEUE_TOKEN" => Err(QueueError::InvalidQueueToken),
            other => Err(QueueError::Store(format!("unknown script code: {other}"))),
        }
    }

    async fn pop_front(
        &self,
        event_id: &EventId,
        count: u64,
    ) -> Result<Vec<UserId>, QueueError> {
        let mut conn = self.conn_manager.clone();

        #[allow(clippy::cast_possible_truncation)]
        let popped: Vec<(String, f64)> = conn
            .zpopmin(keys::queue(event_id), count as isize)
            .await
            .map_err(|e| Self::store_err("failed to pop queue", &e))?;

        Ok(popped
            .into_iter()
            .map(|(member, _score)| UserId::new(member))
            .collect())
    }

    async fn evict(&self, event_id: &EventId, user_id: &UserId) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(keys::queue(event_id), user_id.as_str())
            .ignore()
            .del(keys::user_info(event_id, user_id))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::store_err("failed to evict user", &e))?;
        Ok(())
    }

    async fn queue_len(&self, event_id: &EventId) -> Result<u64, QueueError> {
        let mut conn = self.conn_manager.clone();
        conn.zcard(keys::queue(event_id))
            .await
            .map_err(|e| Self::store_err("failed to read queue length", &e))
    }

    async fn put_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        pass: &str,
        ttl_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .set_ex(keys::pass(event_id, user_id), pass, ttl_seconds)
            .await
            .map_err(|e| Self::store_err("failed to store pass", &e))?;

        tracing::info!(event_id = %event_id, user_id = %user_id, ttl_seconds, "queue pass stored");
        metrics::counter!("queue_passes_issued_total").increment(1);
        Ok(())
    }

    async fn get_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn_manager.clone();
        conn.get(keys::pass(event_id, user_id))
            .await
            .map_err(|e| Self::store_err("failed to read pass", &e))
    }

    async fn delete_pass(&self, event_id: &EventId, user_id: &UserId) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(keys::pass(event_id, user_id))
            .await
            .map_err(|e| Self::store_err("failed to delete pass", &e))?;
        Ok(())
    }

    async fn count_active_passes(&self, event_id: &EventId) -> Result<u64, QueueError> {
        let mut conn = self.conn_manager.clone();
        let pattern = keys::pass_pattern(event_id);

        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| Self::store_err("failed to scan passes", &e))?;

        let mut count = 0u64;
        while let Some(_key) = iter.next_item().await {
            count += 1;
            if count >= PASS_SCAN_BOUND {
                break;
            }
        }
        Ok(count)
    }

    async fn set_config(
        &self,
        event_id: &EventId,
        config: &EventQueueConfig,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .hset_multiple(
                keys::config(event_id),
                &[
                    ("max_concurrent_bookings", config.max_concurrent_bookings),
                    ("queue_pass_ttl_minutes", config.queue_pass_ttl_minutes),
                ],
            )
            .await
            .map_err(|e| Self::store_err("failed to store config", &e))?;
        Ok(())
    }

    async fn get_config(
        &self,
        event_id: &EventId,
    ) -> Result<Option<EventQueueConfig>, QueueError> {
        let mut conn = self.conn_manager.clone();
        let fields: HashMap<String, u32> = conn
            .hgetall(keys::config(event_id))
            .await
            .map_err(|e| Self::store_err("failed to read config", &e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(EventQueueConfig {
            max_concurrent_bookings: fields.get("max_concurrent_bookings").copied().unwrap_or(0),
            queue_pass_ttl_minutes: fields.get("queue_pass_ttl_minutes").copied().unwrap_or(0),
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
    async fn join_position_leave_roundtrip() {
        let store = RedisQueueStore::new("redis://127.0.0.1:6379").await.unwrap();
        let event = EventId::new(format!("test-event-{}", uuid::Uuid::new_v4()));
        let user = UserId::new("u1");

        let outcome = store.join(&event, &user, "tok-1", 60, 0).await.unwrap();
        assert_eq!(outcome.position, 1);
        assert_eq!(outcome.total, 1);

        let position = store.position(&event, &user).await.unwrap();
        assert_eq!(position.position, Some(1));

        let err = store.leave(&event, &user, "wrong").await.unwrap_err();
        assert_eq!(err, QueueError::InvalidQueueToken);

        store.leave(&event, &user, "tok-1").await.unwrap();
        assert!(!store.position(&event, &user).await.unwrap().is_in_queue());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn pop_front_returns_fifo_order() {
        let store = RedisQueueStore::new("redis://127.0.0.1:6379").await.unwrap();
        let event = EventId::new(format!("test-event-{}", uuid::Uuid::new_v4()));

        for i in 0..3 {
            let user = UserId::new(format!("u{i}"));
            store.join(&event, &user, "tok", 60, 0).await.unwrap();
        }

        let popped = store.pop_front(&event, 2).await.unwrap();
        assert_eq!(popped, vec![UserId::new("u0"), UserId::new("u1")]);
        assert_eq!(store.queue_len(&event).await.unwrap(), 1);
    }
}
