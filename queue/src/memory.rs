//! In-memory queue store for tests and single-node development.
//!
//! One mutex guards all queues; each operation runs inside the critical
//! section, mirroring the Redis scripts' atomicity. Ordering uses a
//! monotonic sequence as the tie-break, so two joins in the same clock
//! reading stay FIFO, stable within a boot, like the Redis tie-break.

use crate::store::{EventQueueConfig, JoinOutcome, QueueError, QueuePosition, QueueStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stampede_core::clock::{Clock, SystemClock};
use stampede_core::types::{EventId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct Entry {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct Pass {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct EventQueue {
    /// (score micros, sequence) -> user id; BTreeMap keeps FIFO order.
    order: BTreeMap<(i64, u64), String>,
    entries: HashMap<String, Entry>,
    passes: HashMap<String, Pass>,
    config: Option<EventQueueConfig>,
}

impl EventQueue {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.passes.retain(|_, pass| pass.expires_at > now);
        // Only the metadata hash carries a TTL; the ordered set keeps the
        // member, matching Redis.
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    fn rank_of(&self, user_id: &str) -> Option<u64> {
        self.order
            .values()
            .position(|member| member == user_id)
            .map(|rank| rank as u64)
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, EventQueue>,
    sequence: u64,
}

/// In-memory implementation of [`QueueStore`].
#[derive(Clone)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueStore {
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

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Store("queue state poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn join(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
        ttl_seconds: u64,
        max_queue_size: u64,
    ) -> Result<JoinOutcome, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.sequence += 1;
        let sequence = state.sequence;

        let queue = state.queues.entry(event_id.to_string()).or_default();
        queue.purge_expired(now);

        if let Some(rank) = queue.rank_of(user_id.as_str()) {
            return Err(QueueError::AlreadyInQueue { position: rank + 1 });
        }
        let total = queue.order.len() as u64;
        if max_queue_size > 0 && total >= max_queue_size {
            return Err(QueueError::QueueFull);
        }

        let micros = now.timestamp_micros();
        #[allow(clippy::cast_precision_loss)]
        let joined_at = micros as f64 / 1_000_000.0;

        queue.order.insert((micros, sequence), user_id.to_string());
        queue.entries.insert(
            user_id.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now
                    + chrono::Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX)),
            },
        );

        let position = queue
            .rank_of(user_id.as_str())
            .map_or(1, |rank| rank + 1);

        Ok(JoinOutcome {
            position,
            total: queue.order.len() as u64,
            joined_at,
        })
    }

    async fn position(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<QueuePosition, QueueError> {
        let mut state = self.lock()?;
        let Some(queue) = state.queues.get_mut(event_id.as_str()) else {
            return Ok(QueuePosition {
                position: None,
                total: 0,
            });
        };

        Ok(QueuePosition {
            position: queue.rank_of(user_id.as_str()).map(|rank| rank + 1),
            total: queue.order.len() as u64,
        })
    }

    async fn leave(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let queue = state
            .queues
            .get_mut(event_id.as_str())
            .ok_or(QueueError::NotInQueue)?;

        if queue.rank_of(user_id.as_str()).is_none() {
            return Err(QueueError::NotInQueue);
        }
        let entry = queue
            .entries
            .get(user_id.as_str())
            .ok_or(QueueError::InvalidQueueToken)?;
        if entry.token != token {
            return Err(QueueError::InvalidQueueToken);
        }

        queue.order.retain(|_, member| member.as_str() != user_id.as_str());
        queue.entries.remove(user_id.as_str());
        Ok(())
    }

    async fn pop_front(
        &self,
        event_id: &EventId,
        count: u64,
    ) -> Result<Vec<UserId>, QueueError> {
        let mut state = self.lock()?;
        let Some(queue) = state.queues.get_mut(event_id.as_str()) else {
            return Ok(Vec::new());
        };

        let mut popped = Vec::new();
        for _ in 0..count {
            let Some((&key, _)) = queue.order.iter().next() else {
                break;
            };
            if let Some(member) = queue.order.remove(&key) {
                queue.entries.remove(&member);
                popped.push(UserId::new(member));
            }
        }
        Ok(popped)
    }

    async fn evict(&self, event_id: &EventId, user_id: &UserId) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(queue) = state.queues.get_mut(event_id.as_str()) {
            queue.order.retain(|_, member| member.as_str() != user_id.as_str());
            queue.entries.remove(user_id.as_str());
        }
        Ok(())
    }

    async fn queue_len(&self, event_id: &EventId) -> Result<u64, QueueError> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(event_id.as_str())
            .map_or(0, |queue| queue.order.len() as u64))
    }

    async fn put_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        pass: &str,
        ttl_seconds: u64,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let queue = state.queues.entry(event_id.to_string()).or_default();
        queue.passes.insert(
            user_id.to_string(),
            Pass {
                value: pass.to_string(),
                expires_at: now
                    + chrono::Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX)),
            },
        );
        Ok(())
    }

    async fn get_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<Option<String>, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let Some(queue) = state.queues.get_mut(event_id.as_str()) else {
            return Ok(None);
        };
        queue.purge_expired(now);
        Ok(queue.passes.get(user_id.as_str()).map(|pass| pass.value.clone()))
    }

    async fn delete_pass(&self, event_id: &EventId, user_id: &UserId) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(queue) = state.queues.get_mut(event_id.as_str()) {
            queue.passes.remove(user_id.as_str());
        }
        Ok(())
    }

    async fn count_active_passes(&self, event_id: &EventId) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let Some(queue) = state.queues.get_mut(event_id.as_str()) else {
            return Ok(0);
        };
        queue.purge_expired(now);
        Ok(queue.passes.len() as u64)
    }

    async fn set_config(
        &self,
        event_id: &EventId,
        config: &EventQueueConfig,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state
            .queues
            .entry(event_id.to_string())
            .or_default()
            .config = Some(*config);
        Ok(())
    }

    async fn get_config(
        &self,
        event_id: &EventId,
    ) -> Result<Option<EventQueueConfig>, QueueError> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(event_id.as_str())
            .and_then(|queue| queue.config))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_is_fifo_and_double_join_is_rejected_with_position() {
        let store = InMemoryQueueStore::new();
        let event = EventId::new("e1");

        for i in 1..=3 {
            let user = UserId::new(format!("u{i}"));
            let outcome = store.join(&event, &user, "tok", 1800, 0).await.unwrap();
            assert_eq!(outcome.position, i);
            assert_eq!(outcome.total, i);
        }

        // Second join reports the unchanged position.
        let err = store
            .join(&event, &UserId::new("u2"), "tok", 1800, 0)
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::AlreadyInQueue { position: 2 });
    }

    #[tokio::test]
    async fn queue_cap_is_enforced() {
        let store = InMemoryQueueStore::new();
        let event = EventId::new("e1");

        store
            .join(&event, &UserId::new("u1"), "tok", 1800, 1)
            .await
            .unwrap();
        let err = store
            .join(&event, &UserId::new("u2"), "tok", 1800, 1)
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::QueueFull);
    }

    #[tokio::test]
    async fn pop_front_preserves_join_order() {
        let store = InMemoryQueueStore::new();
        let event = EventId::new("e1");

        for i in 0..5 {
            store
                .join(&event, &UserId::new(format!("u{i}")), "tok", 1800, 0)
                .await
                .unwrap();
        }

        let popped = store.pop_front(&event, 3).await.unwrap();
        assert_eq!(
            popped,
            vec![UserId::new("u0"), UserId::new("u1"), UserId::new("u2")]
        );
        // Remaining users shifted to the front.
        let position = store.position(&event, &UserId::new("u3")).await.unwrap();
        assert_eq!(position.position, Some(1));
    }

    #[tokio::test]
    async fn leave_requires_matching_token() {
        let store = InMemoryQueueStore::new();
        let event = EventId::new("e1");
        let user = UserId::new("u1");

        store.join(&event, &user, "secret", 1800, 0).await.unwrap();

        assert_eq!(
            store.leave(&event, &user, "wrong").await.unwrap_err(),
            QueueError::InvalidQueueToken
        );
        store.leave(&event, &user, "secret").await.unwrap();
        assert_eq!(
            store.leave(&event, &user, "secret").await.unwrap_err(),
            QueueError::NotInQueue
        );
    }

    #[tokio::test]
    async fn passes_expire_with_their_ttl() {
        let clock = Arc::new(stampede_core::clock::FixedClock::new(Utc::now()));
        let store = InMemoryQueueStore::with_clock(clock.clone());
        let event = EventId::new("e1");
        let user = UserId::new("u1");

        store.put_pass(&event, &user, "pass-value", 300).await.unwrap();
        assert_eq!(
            store.get_pass(&event, &user).await.unwrap(),
            Some("pass-value".to_string())
        );
        assert_eq!(store.count_active_passes(&event).await.unwrap(), 1);

        clock.advance_secs(301);
        assert_eq!(store.get_pass(&event, &user).await.unwrap(), None);
        assert_eq!(store.count_active_passes(&event).await.unwrap(), 0);
    }
}
