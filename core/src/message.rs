//! The JSON message envelope carried on every bus topic.
//!
//! Every message is a [`BusMessage`]: a fixed header set plus an arbitrary
//! JSON payload. The header fields mirror what consumers need without
//! decoding the payload: routing (`event_type`), dedup (`event_id`),
//! provenance (`source`), per-saga ordering (`saga_id`), and replay
//! collapsing (`idempotency_key`).

use crate::types::SagaId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error raised when encoding or decoding a bus message payload.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The payload could not be serialized to JSON.
    #[error("failed to encode payload for '{event_type}': {source}")]
    Encode {
        /// The event type being encoded.
        event_type: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// The payload could not be decoded into the requested type.
    #[error("failed to decode payload of '{event_type}': {source}")]
    Decode {
        /// The event type being decoded.
        event_type: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

/// A message as it travels on the event bus.
///
/// Serialized as a single JSON document; the payload is embedded, not
/// double-encoded, so messages stay greppable on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Routing discriminator, e.g. `booking.created` or `payment.success`.
    pub event_type: String,
    /// Unique id of this message, for consumer-side dedup.
    pub event_id: String,
    /// Component that produced the message, e.g. `reservation-service`.
    pub source: String,
    /// Saga this message belongs to; doubles as the partition key for
    /// per-saga ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<SagaId>,
    /// Idempotency key propagated from the original client request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Number of delivery attempts already spent on this message. Workers
    /// increment this before republishing on a retryable failure.
    #[serde(default)]
    pub retry_count: u32,
    /// When the producing component emitted the message.
    pub occurred_at: DateTime<Utc>,
    /// The JSON payload.
    pub payload: serde_json::Value,
}

impl BusMessage {
    /// Build a message from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Encode`] if the payload cannot be serialized.
    pub fn new<P: Serialize>(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: &P,
    ) -> Result<Self, MessageError> {
        let event_type = event_type.into();
        let payload = serde_json::to_value(payload).map_err(|source| MessageError::Encode {
            event_type: event_type.clone(),
            source,
        })?;
        Ok(Self {
            event_type,
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            saga_id: None,
            idempotency_key: None,
            retry_count: 0,
            occurred_at: Utc::now(),
            payload,
        })
    }

    /// Attach a saga id (also used as the partition key by publishers).
    #[must_use]
    pub const fn with_saga_id(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Attach the client idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Decode the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Decode`] if the payload does not match `P`.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, MessageError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| MessageError::Decode {
            event_type: self.event_type.clone(),
            source,
        })
    }

    /// Copy of this message with `retry_count` incremented, for republishing
    /// after a retryable worker failure.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BusMessage {{ type: {}, id: {}, retries: {} }}",
            self.event_type, self.event_id, self.retry_count
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        booking_id: String,
        quantity: u32,
    }

    #[test]
    fn envelope_roundtrip_preserves_payload() {
        let payload = Payload {
            booking_id: "b-1".to_string(),
            quantity: 3,
        };
        let message = BusMessage::new("booking.created", "reservation-service", &payload).unwrap();

        let json = serde_json::to_string(&message).unwrap();
        let decoded: BusMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.event_type, "booking.created");
        assert_eq!(decoded.decode::<Payload>().unwrap(), payload);
    }

    #[test]
    fn next_attempt_increments_retry_count_only() {
        let message = BusMessage::new("x", "test", &serde_json::json!({})).unwrap();
        let retried = message.next_attempt();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.event_id, message.event_id);
    }

    #[test]
    fn absent_headers_are_omitted_from_the_wire() {
        let message = BusMessage::new("x", "test", &serde_json::json!({})).unwrap();
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("saga_id"));
        assert!(!json.contains("idempotency_key"));
    }

    #[test]
    fn decode_mismatch_is_an_error() {
        let message = BusMessage::new("x", "test", &serde_json::json!({"a": 1})).unwrap();
        assert!(message.decode::<Payload>().is_err());
    }
}
