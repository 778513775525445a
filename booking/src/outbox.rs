//! Transactional outbox: durable staging for events that must reach the
//! bus at least once after the owning transaction commits.
//!
//! The booking ledger stores stage every lifecycle event
//! (`booking.created` / `.confirmed` / `.cancelled` / `.expired`) here in
//! the same transaction as the row write ([`stage`] takes any executor, so
//! callers inside a transaction commit the event with their change); the
//! [`OutboxRelay`] drains pending rows to the bus in the background,
//! retrying with a bounded budget before parking the row as `failed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use stampede_bus::topics;
use stampede_core::event_bus::EventBus;
use stampede_core::message::BusMessage;
use stampede_core::types::Booking;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Message source tag stamped on ledger-staged events.
const SOURCE: &str = "booking-ledger";

/// Outbox transport/storage fault.
#[derive(Error, Debug, Clone)]
#[error("outbox error: {0}")]
pub struct OutboxError(pub String);

/// Publication state of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Waiting for the relay.
    Pending,
    /// Delivered to the bus.
    Published,
    /// Retry budget exhausted; needs operator attention.
    Failed,
}

impl OutboxStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(OutboxError(format!("invalid outbox status: {other}"))),
        }
    }
}

/// A staged event.
#[derive(Clone, Debug)]
pub struct OutboxEntry {
    /// Row id.
    pub id: i64,
    /// Aggregate kind, e.g. `booking`.
    pub aggregate_type: String,
    /// Aggregate id; doubles as the partition key on publish.
    pub aggregate_id: String,
    /// Event type header.
    pub event_type: String,
    /// The full [`BusMessage`] as JSON.
    pub payload: serde_json::Value,
    /// Destination topic.
    pub topic: String,
    /// Publication state.
    pub status: OutboxStatus,
    /// Delivery attempts spent.
    pub retry_count: i32,
    /// Delivery attempt budget.
    pub max_retries: i32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// When the row was delivered, if it was.
    pub published_at: Option<DateTime<Utc>>,
}

/// Fields for staging a new event.
#[derive(Clone, Debug)]
pub struct NewOutboxEntry {
    /// Aggregate kind, e.g. `booking`.
    pub aggregate_type: String,
    /// Aggregate id; doubles as the partition key on publish.
    pub aggregate_id: String,
    /// Destination topic.
    pub topic: String,
    /// The message to deliver.
    pub message: BusMessage,
}

impl NewOutboxEntry {
    /// Build a booking lifecycle event for the `booking.events` topic.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the payload cannot be encoded.
    pub fn booking_event(booking: &Booking, event_type: &str) -> Result<Self, OutboxError> {
        let payload = serde_json::json!({
            "booking_id": booking.id,
            "user_id": booking.user_id,
            "event_id": booking.event_id,
            "show_id": booking.show_id,
            "zone_id": booking.zone_id,
            "quantity": booking.quantity,
            "total_price_cents": booking.total_price_cents,
            "status": booking.status.as_str(),
            "payment_id": booking.payment_id,
            "confirmation_code": booking.confirmation_code,
        });

        let message = BusMessage::new(event_type, SOURCE, &payload)
            .map_err(|e| OutboxError(e.to_string()))?;
        let message = match &booking.idempotency_key {
            Some(key) => message.with_idempotency_key(key.clone()),
            None => message,
        };

        Ok(Self {
            aggregate_type: "booking".to_string(),
            aggregate_id: booking.id.to_string(),
            topic: topics::BOOKING_EVENTS.to_string(),
            message,
        })
    }
}

/// Insert an outbox row with the given executor.
///
/// Callers inside a transaction pass `&mut *tx` so the staged event commits
/// (or rolls back) together with their state change.
///
/// # Errors
///
/// Returns [`OutboxError`] on encoding or storage faults.
pub async fn stage<'e, E>(executor: E, entry: &NewOutboxEntry) -> Result<i64, OutboxError>
where
    E: sqlx::PgExecutor<'e>,
{
    let payload = serde_json::to_value(&entry.message).map_err(|e| OutboxError(e.to_string()))?;

    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO outbox (aggregate_type, aggregate_id, event_type, payload, topic)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        ",
    )
    .bind(&entry.aggregate_type)
    .bind(&entry.aggregate_id)
    .bind(&entry.message.event_type)
    .bind(payload)
    .bind(&entry.topic)
    .fetch_one(executor)
    .await
    .map_err(|e| OutboxError(e.to_string()))?;

    Ok(id)
}

/// Storage for staged events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stage an event.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage faults.
    async fn enqueue(&self, entry: &NewOutboxEntry) -> Result<i64, OutboxError>;

    /// Pending rows, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage faults.
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Mark a row delivered.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage faults.
    async fn mark_published(&self, id: i64) -> Result<(), OutboxError>;

    /// Record a failed attempt; the row parks as `failed` once the retry
    /// budget is spent, otherwise stays `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage faults.
    async fn mark_attempt_failed(&self, id: i64) -> Result<(), OutboxError>;
}

/// Postgres outbox (table in `schema.sql`).
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, entry: &NewOutboxEntry) -> Result<i64, OutboxError> {
        stage(&self.pool, entry).await
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT id, aggregate_type, aggregate_id, event_type, payload, topic,
                   status, retry_count, max_retries, created_at, published_at
            FROM outbox
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let status_str: String = row.get("status");
                Ok(OutboxEntry {
                    id: row.get("id"),
                    aggregate_type: row.get("aggregate_type"),
                    aggregate_id: row.get("aggregate_id"),
                    event_type: row.get("event_type"),
                    payload: row.get("payload"),
                    topic: row.get("topic"),
                    status: OutboxStatus::parse(&status_str)?,
                    retry_count: row.get("retry_count"),
                    max_retries: row.get("max_retries"),
                    created_at: row.get("created_at"),
                    published_at: row.get("published_at"),
                })
            })
            .collect()
    }

    async fn mark_published(&self, id: i64) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            UPDATE outbox
            SET status = 'published', published_at = NOW(), updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError(e.to_string()))?;
        Ok(())
    }

    async fn mark_attempt_failed(&self, id: i64) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            UPDATE outbox
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retries
                              THEN 'failed' ELSE 'pending' END,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError(e.to_string()))?;
        Ok(())
    }
}

/// In-memory outbox for tests.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, for assertions.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, entry: &NewOutboxEntry) -> Result<i64, OutboxError> {
        let payload =
            serde_json::to_value(&entry.message).map_err(|e| OutboxError(e.to_string()))?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| OutboxError("outbox state poisoned".to_string()))?;
        let id = entries.len() as i64 + 1;
        entries.push(OutboxEntry {
            id,
            aggregate_type: entry.aggregate_type.clone(),
            aggregate_id: entry.aggregate_id.clone(),
            event_type: entry.message.event_type.clone(),
            payload,
            topic: entry.topic.clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: 5,
            created_at: Utc::now(),
            published_at: None,
        });
        Ok(id)
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| OutboxError("outbox state poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|entry| entry.status == OutboxStatus::Pending)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: i64) -> Result<(), OutboxError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| OutboxError("outbox state poisoned".to_string()))?;
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) {
            entry.status = OutboxStatus::Published;
            entry.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_attempt_failed(&self, id: i64) -> Result<(), OutboxError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| OutboxError("outbox state poisoned".to_string()))?;
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) {
            entry.retry_count += 1;
            if entry.retry_count >= entry.max_retries {
                entry.status = OutboxStatus::Failed;
            }
        }
        Ok(())
    }
}

/// Background relay from the outbox to the bus.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    interval: Duration,
    batch_limit: i64,
}

impl OutboxRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            store,
            bus,
            interval,
            batch_limit,
        }
    }

    /// Run until the shutdown channel flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_ms = self.interval.as_millis(), "outbox relay started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = self.drain_once().await {
                            tracing::error!(error = %error, "outbox drain failed");
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("outbox relay stopping");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// One drain pass. Public so tests can drive it directly.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the pending scan fails; per-row publish
    /// failures are recorded on the row.
    pub async fn drain_once(&self) -> Result<usize, OutboxError> {
        let pending = self.store.fetch_pending(self.batch_limit).await?;
        let mut delivered = 0;

        for entry in pending {
            let message: BusMessage = match serde_json::from_value(entry.payload.clone()) {
                Ok(message) => message,
                Err(error) => {
                    tracing::error!(
                        outbox_id = entry.id,
                        error = %error,
                        "undecodable outbox payload, parking row"
                    );
                    self.store.mark_attempt_failed(entry.id).await?;
                    continue;
                },
            };

            match self
                .bus
                .publish(&entry.topic, &entry.aggregate_id, &message)
                .await
            {
                Ok(()) => {
                    self.store.mark_published(entry.id).await?;
                    delivered += 1;
                },
                Err(error) => {
                    tracing::warn!(
                        outbox_id = entry.id,
                        topic = %entry.topic,
                        retry_count = entry.retry_count,
                        error = %error,
                        "outbox publish failed"
                    );
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    self.store.mark_attempt_failed(entry.id).await?;
                },
            }
        }

        if delivered > 0 {
            metrics::counter!("outbox_published_total").increment(delivered as u64);
        }
        Ok(delivered)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stampede_bus::memory::InMemoryEventBus;

    fn staged(event_type: &str) -> NewOutboxEntry {
        NewOutboxEntry {
            aggregate_type: "booking".to_string(),
            aggregate_id: "b-1".to_string(),
            topic: "booking.events".to_string(),
            message: BusMessage::new(event_type, "test", &serde_json::json!({"k": 1})).unwrap(),
        }
    }

    #[tokio::test]
    async fn relay_delivers_pending_rows_and_marks_them() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        store.enqueue(&staged("booking.created")).await.unwrap();
        store.enqueue(&staged("booking.confirmed")).await.unwrap();

        let relay = OutboxRelay::new(
            Arc::clone(&store) as Arc<dyn OutboxStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Duration::from_millis(50),
            10,
        );

        let delivered = relay.drain_once().await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(
            bus.event_types_on("booking.events"),
            vec!["booking.created", "booking.confirmed"]
        );
        assert!(
            store
                .entries()
                .iter()
                .all(|entry| entry.status == OutboxStatus::Published)
        );

        // Nothing pending on the next pass.
        assert_eq!(relay.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_budget_parks_rows_as_failed() {
        let store = InMemoryOutboxStore::new();
        let id = store.enqueue(&staged("booking.created")).await.unwrap();

        for _ in 0..5 {
            store.mark_attempt_failed(id).await.unwrap();
        }

        let entries = store.entries();
        assert_eq!(entries[0].status, OutboxStatus::Failed);
        assert_eq!(entries[0].retry_count, 5);
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }
}
