//! The queue store contract shared by the Redis and in-memory waiting rooms.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stampede_core::failure::{Classified, FailureKind};
use stampede_core::types::{EventId, UserId};
use thiserror::Error;

/// Errors surfaced by the queue controller and stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The user already holds a place in this event's queue.
    #[error("already in queue at position {position}")]
    AlreadyInQueue {
        /// The user's current 1-indexed position.
        position: u64,
    },

    /// The queue reached its configured size cap.
    #[error("queue is full")]
    QueueFull,

    /// The user has no entry in this event's queue.
    #[error("not in queue")]
    NotInQueue,

    /// The presented queue token does not match the stored one.
    #[error("invalid queue token")]
    InvalidQueueToken,

    /// A pass could not be recorded in the store, so none was issued.
    #[error("queue pass was not issued")]
    PassNotIssued,

    /// Transport or evaluation fault in the underlying store.
    #[error("queue store error: {0}")]
    Store(String),
}

impl QueueError {
    /// Stable error code surfaced to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInQueue { .. } => "ALREADY_IN_QUEUE",
            Self::QueueFull => "QUEUE_FULL",
            Self::NotInQueue => "NOT_IN_QUEUE",
            Self::InvalidQueueToken => "INVALID_QUEUE_TOKEN",
            Self::PassNotIssued => "PASS_NOT_ISSUED",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

impl Classified for QueueError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::AlreadyInQueue { .. } | Self::QueueFull => FailureKind::Conflict,
            Self::NotInQueue => FailureKind::NotFound,
            Self::InvalidQueueToken => FailureKind::Unauthorized,
            Self::PassNotIssued | Self::Store(_) => FailureKind::Retryable,
        }
    }
}

/// Result of joining a queue.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JoinOutcome {
    /// 1-indexed position after joining.
    pub position: u64,
    /// Total queue size after joining.
    pub total: u64,
    /// Join timestamp in fractional epoch seconds (the ordering score).
    pub joined_at: f64,
}

/// Result of a position lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuePosition {
    /// 1-indexed position, `None` for non-members.
    pub position: Option<u64>,
    /// Total queue size.
    pub total: u64,
}

impl QueuePosition {
    /// Whether the user is in the queue.
    #[must_use]
    pub const fn is_in_queue(&self) -> bool {
        self.position.is_some()
    }
}

/// Optional per-event admission configuration, cached in the queue store as
/// a read-mostly projection of the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQueueConfig {
    /// Cap on concurrently outstanding queue passes; 0 disables the cap.
    pub max_concurrent_bookings: u32,
    /// Pass lifetime override in minutes; 0 falls back to the controller
    /// default.
    pub queue_pass_ttl_minutes: u32,
}

/// The queue store contract.
///
/// `join` and `leave` are atomic with respect to each other and to
/// `pop_front`; implementations run them on a single evaluator.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Join the event queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::AlreadyInQueue`] (with the current position),
    /// [`QueueError::QueueFull`] when `max_queue_size > 0` and reached, or
    /// [`QueueError::Store`].
    async fn join(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
        ttl_seconds: u64,
        max_queue_size: u64,
    ) -> Result<JoinOutcome, QueueError>;

    /// 1-indexed position and total for a user.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn position(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<QueuePosition, QueueError>;

    /// Leave the queue; requires the token handed out on join.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotInQueue`], [`QueueError::InvalidQueueToken`], or
    /// [`QueueError::Store`].
    async fn leave(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
    ) -> Result<(), QueueError>;

    /// Atomically remove and return up to `count` users from the front.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn pop_front(&self, event_id: &EventId, count: u64)
    -> Result<Vec<UserId>, QueueError>;

    /// Remove a user without a token check. Internal promotion path: used
    /// when a pass is issued, never exposed to clients.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn evict(&self, event_id: &EventId, user_id: &UserId) -> Result<(), QueueError>;

    /// Current queue length.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn queue_len(&self, event_id: &EventId) -> Result<u64, QueueError>;

    /// Record the canonical pass value with a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn put_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        pass: &str,
        ttl_seconds: u64,
    ) -> Result<(), QueueError>;

    /// Fetch the canonical pass value, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn get_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<Option<String>, QueueError>;

    /// Delete a pass (called on successful booking).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn delete_pass(&self, event_id: &EventId, user_id: &UserId) -> Result<(), QueueError>;

    /// Bounded count of outstanding passes for an event.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn count_active_passes(&self, event_id: &EventId) -> Result<u64, QueueError>;

    /// Cache per-event admission configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn set_config(
        &self,
        event_id: &EventId,
        config: &EventQueueConfig,
    ) -> Result<(), QueueError>;

    /// Read per-event admission configuration, `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    async fn get_config(
        &self,
        event_id: &EventId,
    ) -> Result<Option<EventQueueConfig>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(QueueError::AlreadyInQueue { position: 3 }.code(), "ALREADY_IN_QUEUE");
        assert_eq!(QueueError::QueueFull.code(), "QUEUE_FULL");
        assert_eq!(QueueError::NotInQueue.code(), "NOT_IN_QUEUE");
        assert_eq!(QueueError::InvalidQueueToken.code(), "INVALID_QUEUE_TOKEN");
    }

    #[test]
    fn domain_rejections_are_not_retryable() {
        assert!(!QueueError::QueueFull.failure_kind().is_retryable());
        assert!(!QueueError::InvalidQueueToken.failure_kind().is_retryable());
        assert!(QueueError::Store("io".to_string()).failure_kind().is_retryable());
    }
}
