//! Saga state storage contract and the dead-letter record.

use crate::instance::{SagaInstance, SagaStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stampede_core::types::SagaId;
use thiserror::Error;

/// Errors surfaced by saga storage.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    /// No instance with the given id.
    #[error("saga not found")]
    NotFound,

    /// Storage fault.
    #[error("saga store error: {0}")]
    Database(String),

    /// Bus fault while the orchestrator was advancing a saga.
    #[error("saga bus error: {0}")]
    Bus(String),

    /// Message payload could not be encoded or decoded.
    #[error("saga codec error: {0}")]
    Codec(String),
}

/// A poison message that exhausted its retries (or failed terminally).
#[derive(Clone, Debug)]
pub struct DeadLetter {
    /// Row id.
    pub id: i64,
    /// Owning saga, when the message carried one.
    pub saga_id: Option<SagaId>,
    /// Topic the message was consumed from.
    pub topic: String,
    /// Partition key of the message.
    pub message_key: String,
    /// The original message, verbatim.
    pub message_value: serde_json::Value,
    /// Final error message.
    pub error_message: String,
    /// Attempts spent before dead-lettering.
    pub retry_count: i32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// When an operator reprocessed the row, if ever.
    pub processed_at: Option<DateTime<Utc>>,
    /// Whether the row was reprocessed.
    pub processed: bool,
}

/// Fields for writing a new dead letter.
#[derive(Clone, Debug)]
pub struct NewDeadLetter {
    /// Owning saga, when known.
    pub saga_id: Option<SagaId>,
    /// Topic the message was consumed from.
    pub topic: String,
    /// Partition key of the message.
    pub message_key: String,
    /// The original message, verbatim.
    pub message_value: serde_json::Value,
    /// Final error message.
    pub error_message: String,
    /// Attempts spent before dead-lettering.
    pub retry_count: i32,
}

/// Durable storage for saga instances, transitions, and dead letters.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert a new instance.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn insert(&self, instance: &SagaInstance) -> Result<(), SagaError>;

    /// Persist an instance's current state.
    ///
    /// # Errors
    ///
    /// [`SagaError::NotFound`] if the instance was never inserted, or
    /// [`SagaError::Database`].
    async fn update(&self, instance: &SagaInstance) -> Result<(), SagaError>;

    /// Fetch an instance by id.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn get(&self, id: &SagaId) -> Result<Option<SagaInstance>, SagaError>;

    /// Find the saga (any status) created for a booking; used to drop
    /// duplicate `payment.success` deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn find_by_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<SagaInstance>, SagaError>;

    /// Append a status transition to the audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn record_transition(
        &self,
        saga_id: &SagaId,
        from: SagaStatus,
        to: SagaStatus,
        note: Option<&str>,
    ) -> Result<(), SagaError>;

    /// Persist a dead letter; returns its row id.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn push_dead_letter(&self, letter: &NewDeadLetter) -> Result<i64, SagaError>;

    /// Unprocessed dead letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, SagaError>;

    /// Mark a dead letter as reprocessed.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage faults.
    async fn mark_dead_letter_processed(&self, id: i64) -> Result<(), SagaError>;
}
