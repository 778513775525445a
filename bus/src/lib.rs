//! Event bus implementations for the Stampede booking core.
//!
//! Two implementations of [`stampede_core::event_bus::EventBus`]:
//!
//! - [`KafkaEventBus`]: production transport over any Kafka-compatible
//!   broker (Redpanda, Apache Kafka, MSK) via rdkafka.
//! - [`memory::InMemoryEventBus`]: synchronous in-process bus for tests and
//!   single-node development, with a published-message log for assertions.
//!
//! # Delivery semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Messages are committed AFTER successful hand-off to the subscriber's
//!   channel; a crash before commit redelivers.
//! - Subscribers MUST be idempotent.
//! - Ordering is guaranteed within a partition key only. Saga traffic keys
//!   by saga id, booking events by booking id.
//!
//! # Two publish paths
//!
//! [`KafkaEventBus`] keeps two producers:
//!
//! - a `FutureProducer` for awaited publishes (saga commands and step events
//!   must not advance until the broker accepted them), and
//! - a `ThreadedProducer` for [`EventBus::publish_nowait`]. The delivery
//!   outcome is reported through librdkafka's own callback thread, so the
//!   request hot path never blocks on the broker and no per-publish task is
//!   spawned. Failures are logged and counted
//!   (`bus_fire_and_forget_failures_total`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod memory;
pub mod topics;

use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{
    BaseRecord, DeliveryResult, FutureProducer, FutureRecord, ProducerContext, ThreadedProducer,
};
use rdkafka::util::Timeout;
use stampede_core::event_bus::{EventBus, EventBusError, MessageStream};
use stampede_core::message::BusMessage;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Producer context that reports fire-and-forget delivery outcomes.
///
/// librdkafka invokes [`ProducerContext::delivery`] from its own polling
/// thread, which is exactly the bounded completion path the hot-path publish
/// contract requires.
struct DeliveryLogContext;

impl ClientContext for DeliveryLogContext {}

impl ProducerContext for DeliveryLogContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, (): ()) {
        match delivery_result {
            Ok(message) => {
                tracing::trace!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "fire-and-forget message delivered"
                );
            },
            Err((error, message)) => {
                tracing::error!(
                    topic = message.topic(),
                    error = %error,
                    "fire-and-forget message delivery failed"
                );
                metrics::counter!("bus_fire_and_forget_failures_total").increment(1);
            },
        }
    }
}

/// Kafka-compatible event bus.
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Producer settings**: acks, compression, delivery timeout
/// - **Consumer group**: explicit id or auto-generated from topics
/// - **Buffer size**: subscriber channel capacity (default: 1000)
/// - **Offset reset**: where new groups start reading (default: "latest")
pub struct KafkaEventBus {
    /// Awaited-delivery producer.
    producer: FutureProducer,
    /// Fire-and-forget producer with a delivery callback.
    nowait_producer: ThreadedProducer<DeliveryLogContext>,
    /// Broker addresses (for creating consumers).
    brokers: String,
    /// Producer timeout.
    timeout: Duration,
    /// Consumer group id (if explicitly set).
    consumer_group: Option<String>,
    /// Message buffer size for subscribers.
    buffer_size: usize,
    /// Auto offset reset policy.
    auto_offset_reset: String,
}

impl KafkaEventBus {
    /// Create a new bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if a producer cannot be
    /// created for the given brokers.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> KafkaEventBusBuilder {
        KafkaEventBusBuilder::default()
    }

    /// The configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn encode(topic: &str, message: &BusMessage) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(message).map_err(|e| EventBusError::PublishFailed {
            topic: topic.to_string(),
            reason: format!("failed to serialize message: {e}"),
        })
    }
}

/// Builder for configuring a [`KafkaEventBus`].
#[derive(Default)]
pub struct KafkaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl KafkaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1", or "all".
    ///
    /// Default: "1".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout. Default: 2 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group id for subscriptions.
    ///
    /// If not set, the group is auto-generated from the sorted topic list.
    /// An explicit group lets multiple service instances share the workload.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the subscriber channel capacity (default: 1000).
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set the auto offset reset policy: "earliest", "latest", or "error".
    ///
    /// Default: "latest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`KafkaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are unset or a
    /// producer cannot be created.
    pub fn build(self) -> Result<KafkaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            EventBusError::ConnectionFailed(format!("failed to create producer: {e}"))
        })?;

        let nowait_producer: ThreadedProducer<DeliveryLogContext> = producer_config
            .create_with_context(DeliveryLogContext)
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!(
                    "failed to create fire-and-forget producer: {e}"
                ))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "KafkaEventBus created"
        );

        Ok(KafkaEventBus {
            producer,
            nowait_producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(2)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl EventBus for KafkaEventBus {
    fn publish(
        &self,
        topic: &str,
        key: &str,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.to_string();
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = KafkaEventBus::encode(&topic, &message)?;

            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            let send_result = self.producer.send(record, Timeout::After(timeout)).await;

            match send_result {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = %key,
                        event_type = %message.event_type,
                        "message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        key = %key,
                        error = %kafka_error,
                        "failed to publish message"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn publish_nowait(
        &self,
        topic: &str,
        key: &str,
        message: &BusMessage,
    ) -> Result<(), EventBusError> {
        let payload = Self::encode(topic, message)?;

        // BaseRecord::send enqueues on librdkafka's internal queue; the
        // delivery outcome arrives on DeliveryLogContext::delivery. The only
        // caller-visible failure is a full local queue.
        self.nowait_producer
            .send(BaseRecord::to(topic).payload(&payload).key(key))
            .map_err(|(kafka_error, _)| {
                metrics::counter!("bus_fire_and_forget_failures_total").increment(1);
                EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: format!("local enqueue failed: {kafka_error}"),
                }
            })
    }

    #[allow(clippy::too_many_lines)] // at-least-once with manual commits needs the branches
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            // Explicit group if set, otherwise deterministic from sorted topics.
            let consumer_group_id = if let Some(group) = consumer_group {
                group
            } else {
                let mut sorted_topics = topics.clone();
                sorted_topics.sort();
                format!("stampede-{}", sorted_topics.join("-"))
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false") // manual commit for at-least-once
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // A task that owns the consumer and forwards messages; commits
            // only after the message reached the channel.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(kafka_message) => {
                            let decoded = match kafka_message.payload() {
                                Some(payload) => serde_json::from_slice::<BusMessage>(payload)
                                    .map_err(|e| {
                                        EventBusError::DeserializationFailed(format!(
                                            "failed to decode message: {e}"
                                        ))
                                    }),
                                None => Err(EventBusError::DeserializationFailed(
                                    "message has no payload".to_string(),
                                )),
                            };

                            if let Ok(message) = &decoded {
                                tracing::trace!(
                                    topic = kafka_message.topic(),
                                    partition = kafka_message.partition(),
                                    offset = kafka_message.offset(),
                                    event_type = %message.event_type,
                                    "received message"
                                );
                            }

                            // Only commit AFTER successful hand-off.
                            if tx.send(decoded).await.is_err() {
                                tracing::debug!("subscriber dropped, exiting consumer task");
                                break; // exit WITHOUT committing
                            }

                            if let Err(e) =
                                consumer.commit_message(&kafka_message, CommitMode::Async)
                            {
                                tracing::warn!(
                                    topic = kafka_message.topic(),
                                    partition = kafka_message.partition(),
                                    offset = kafka_message.offset(),
                                    error = %e,
                                    "failed to commit offset (message may be redelivered)"
                                );
                            }
                        },
                        Err(e) => {
                            let err = EventBusError::TransportError(format!(
                                "failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }
                }

                tracing::debug!("consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaEventBus>();
        assert_sync::<KafkaEventBus>();
    }

    #[test]
    fn builder_default_works() {
        let _builder = KafkaEventBus::builder();
    }

    #[test]
    fn build_without_brokers_fails() {
        assert!(KafkaEventBus::builder().build().is_err());
    }
}
