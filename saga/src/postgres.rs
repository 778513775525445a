//! Postgres saga store (schema in `schema.sql`).

use crate::instance::{SagaInstance, SagaStatus, StepResult};
use crate::store::{DeadLetter, NewDeadLetter, SagaError, SagaStore};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use stampede_core::types::SagaId;
use uuid::Uuid;

/// Postgres implementation of [`SagaStore`].
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db_err(e: &sqlx::Error) -> SagaError {
        SagaError::Database(e.to_string())
    }

    fn row_to_instance(row: &PgRow) -> Result<SagaInstance, SagaError> {
        let status_str: String = row.get("status");
        let status =
            SagaStatus::parse(&status_str).map_err(|e| SagaError::Database(e.to_string()))?;

        let data: Value = row.get("data");
        let data: Map<String, Value> = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let step_results: Value = row.get("step_results");
        let step_results: Vec<StepResult> = serde_json::from_value(step_results)
            .map_err(|e| SagaError::Database(format!("undecodable step_results: {e}")))?;

        let current_step: i32 = row.get("current_step");

        Ok(SagaInstance {
            id: SagaId::from_uuid(row.get("id")),
            definition_id: row.get("definition_id"),
            status,
            data,
            step_results,
            current_step: usize::try_from(current_step).unwrap_or(0),
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn encode_steps(instance: &SagaInstance) -> Result<Value, SagaError> {
        serde_json::to_value(&instance.step_results)
            .map_err(|e| SagaError::Codec(e.to_string()))
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn insert(&self, instance: &SagaInstance) -> Result<(), SagaError> {
        sqlx::query(
            r"
            INSERT INTO saga_instances (
                id, definition_id, status, data, step_results, current_step,
                error, created_at, updated_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(instance.id.as_uuid())
        .bind(&instance.definition_id)
        .bind(instance.status.as_str())
        .bind(Value::Object(instance.data.clone()))
        .bind(Self::encode_steps(instance)?)
        .bind(i32::try_from(instance.current_step).unwrap_or(i32::MAX))
        .bind(instance.error.as_deref())
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        Ok(())
    }

    async fn update(&self, instance: &SagaInstance) -> Result<(), SagaError> {
        let result = sqlx::query(
            r"
            UPDATE saga_instances
               SET status = $2,
                   data = $3,
                   step_results = $4,
                   current_step = $5,
                   error = $6,
                   updated_at = $7,
                   completed_at = $8
             WHERE id = $1
            ",
        )
        .bind(instance.id.as_uuid())
        .bind(instance.status.as_str())
        .bind(Value::Object(instance.data.clone()))
        .bind(Self::encode_steps(instance)?)
        .bind(i32::try_from(instance.current_step).unwrap_or(i32::MAX))
        .bind(instance.error.as_deref())
        .bind(instance.updated_at)
        .bind(instance.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        if result.rows_affected() == 0 {
            return Err(SagaError::NotFound);
        }
        Ok(())
    }

    async fn get(&self, id: &SagaId) -> Result<Option<SagaInstance>, SagaError> {
        let row = sqlx::query("SELECT * FROM saga_instances WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err(&e))?;

        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn find_by_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<SagaInstance>, SagaError> {
        let row = sqlx::query(
            r"
            SELECT * FROM saga_instances
            WHERE data->>'booking_id' = $1
            ORDER BY created_at ASC
            LIMIT 1
            ",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn record_transition(
        &self,
        saga_id: &SagaId,
        from: SagaStatus,
        to: SagaStatus,
        note: Option<&str>,
    ) -> Result<(), SagaError> {
        sqlx::query(
            r"
            INSERT INTO saga_transitions (saga_id, from_status, to_status, note)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(saga_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        Ok(())
    }

    async fn push_dead_letter(&self, letter: &NewDeadLetter) -> Result<i64, SagaError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO saga_dead_letters (
                saga_id, topic, message_key, message_value, error_message, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(letter.saga_id.as_ref().map(SagaId::as_uuid))
        .bind(&letter.topic)
        .bind(&letter.message_key)
        .bind(&letter.message_value)
        .bind(&letter.error_message)
        .bind(letter.retry_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        tracing::warn!(
            dlq_id = id,
            topic = %letter.topic,
            error = %letter.error_message,
            retry_count = letter.retry_count,
            "message added to dead letter queue"
        );
        metrics::counter!("saga_dead_letters_total").increment(1);

        Ok(id)
    }

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, SagaError> {
        let rows = sqlx::query(
            r"
            SELECT id, saga_id, topic, message_key, message_value,
                   error_message, retry_count, created_at, processed_at, processed
            FROM saga_dead_letters
            WHERE NOT processed
            ORDER BY created_at ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        Ok(rows
            .iter()
            .map(|row| DeadLetter {
                id: row.get("id"),
                saga_id: row
                    .get::<Option<Uuid>, _>("saga_id")
                    .map(SagaId::from_uuid),
                topic: row.get("topic"),
                message_key: row.get("message_key"),
                message_value: row.get("message_value"),
                error_message: row.get("error_message"),
                retry_count: row.get("retry_count"),
                created_at: row.get("created_at"),
                processed_at: row.get("processed_at"),
                processed: row.get("processed"),
            })
            .collect())
    }

    async fn mark_dead_letter_processed(&self, id: i64) -> Result<(), SagaError> {
        sqlx::query(
            r"
            UPDATE saga_dead_letters
            SET processed = TRUE, processed_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err(&e))?;

        Ok(())
    }
}
