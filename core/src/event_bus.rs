//! Event bus abstraction for the partitioned, at-least-once transport.
//!
//! The bus moves [`BusMessage`]s between the outbox relay, the saga
//! orchestrator, and the step workers. Two delivery modes exist:
//!
//! - [`EventBus::publish`]: awaited, used wherever the caller must know the
//!   message was accepted (saga commands, step events, outbox delivery).
//! - [`EventBus::publish_nowait`]: fire-and-forget, used for best-effort
//!   saga monitoring traffic (lifecycle events, the DLQ mirror).
//!   Implementations MUST hand the message to the producer's native async
//!   machinery and MUST NOT spawn a task per call; under a 10k-RPS rush a
//!   task per publish accumulates without bound when clients disconnect.
//!
//! # Delivery semantics
//!
//! At-least-once. Consumers commit after hand-off, so a crash redelivers;
//! every handler in this workspace is idempotent. Ordering is guaranteed only
//! within a partition key: saga ids for saga traffic, booking ids for
//! booking events.

use crate::message::BusMessage;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic.
    #[error("publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// A message on the wire could not be decoded.
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Stream of messages from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BusMessage, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so the
/// bus can live behind `Arc<dyn EventBus>` across every service seam.
pub trait EventBus: Send + Sync {
    /// Publish a message to a topic and wait for broker acceptance.
    ///
    /// `key` is the partition key; messages sharing a key are totally
    /// ordered for consumers.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects or the
    /// delivery deadline elapses.
    fn publish(
        &self,
        topic: &str,
        key: &str,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Enqueue a message without waiting for delivery.
    ///
    /// Failures are reported through the producer's completion callback
    /// (logged and counted, never surfaced to the caller). Implementations
    /// must not wrap the enqueue in a spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] only when the message cannot
    /// even be enqueued locally (serialization failure, full local queue).
    fn publish_nowait(&self, topic: &str, key: &str, message: &BusMessage)
    -> Result<(), EventBusError>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>>;
}
