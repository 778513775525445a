//! In-memory event bus for tests and single-node development.
//!
//! Fan-out per topic over unbounded channels, plus a log of everything
//! published so tests can assert on emission order and partition keys.
//! Semantics match the Kafka bus where it matters: per-subscriber delivery,
//! publish order preserved per topic, and `publish_nowait` never failing the
//! caller.

use stampede_core::event_bus::{EventBus, EventBusError, MessageStream};
use stampede_core::message::BusMessage;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A message captured by the published log.
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Partition key supplied by the publisher.
    pub key: String,
    /// The message itself.
    pub message: BusMessage,
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Result<BusMessage, EventBusError>>>>;

/// In-memory implementation of [`EventBus`].
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Subscribers>,
    published: Mutex<Vec<PublishedMessage>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Messages published to one topic, in order.
    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|entry| entry.topic == topic)
            .map(|entry| entry.message)
            .collect()
    }

    /// Event types published to one topic, in order. Convenient for
    /// asserting emission sequences in saga tests.
    #[must_use]
    pub fn event_types_on(&self, topic: &str) -> Vec<String> {
        self.published_on(topic)
            .into_iter()
            .map(|message| message.event_type)
            .collect()
    }

    fn deliver(&self, topic: &str, key: &str, message: &BusMessage) {
        if let Ok(mut log) = self.inner.published.lock() {
            log.push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                message: message.clone(),
            });
        }

        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            if let Some(senders) = subscribers.get_mut(topic) {
                // Drop senders whose subscriber went away.
                senders.retain(|sender| sender.send(Ok(message.clone())).is_ok());
            }
        }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        key: &str,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.deliver(topic, key, message);
        Box::pin(async { Ok(()) })
    }

    fn publish_nowait(
        &self,
        topic: &str,
        key: &str,
        message: &BusMessage,
    ) -> Result<(), EventBusError> {
        self.deliver(topic, key, message);
        Ok(())
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();

            if let Ok(mut subscribers) = inner.subscribers.lock() {
                for topic in topics {
                    subscribers.entry(topic).or_default().push(tx.clone());
                }
            }

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
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn message(event_type: &str) -> BusMessage {
        BusMessage::new(event_type, "test", &serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn subscriber_receives_published_messages_in_order() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["booking.events"]).await.unwrap();

        bus.publish("booking.events", "b-1", &message("booking.created"))
            .await
            .unwrap();
        bus.publish("booking.events", "b-1", &message("booking.confirmed"))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, "booking.created");
        assert_eq!(second.event_type, "booking.confirmed");
    }

    #[tokio::test]
    async fn published_log_captures_topic_and_key() {
        let bus = InMemoryEventBus::new();
        bus.publish_nowait("payment.events", "saga-9", &message("payment.success"))
            .unwrap();

        let log = bus.published();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].topic, "payment.events");
        assert_eq!(log[0].key, "saga-9");
        assert_eq!(bus.event_types_on("payment.events"), vec!["payment.success"]);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();

        bus.publish("b", "k", &message("on.b")).await.unwrap();
        bus.publish("a", "k", &message("on.a")).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.event_type, "on.a");
    }
}
