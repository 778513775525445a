//! In-memory saga store for tests and single-node development.

use crate::instance::{SagaInstance, SagaStatus};
use crate::store::{DeadLetter, NewDeadLetter, SagaError, SagaStore};
use async_trait::async_trait;
use chrono::Utc;
use stampede_core::types::SagaId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct Transition {
    saga_id: SagaId,
    from: SagaStatus,
    to: SagaStatus,
    note: Option<String>,
}

#[derive(Default)]
struct State {
    instances: HashMap<SagaId, SagaInstance>,
    transitions: Vec<Transition>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory implementation of [`SagaStore`].
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<Mutex<State>>,
}

impl InMemorySagaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, SagaError> {
        self.state
            .lock()
            .map_err(|_| SagaError::Database("saga state poisoned".to_string()))
    }

    /// Status transitions recorded for a saga, for assertions.
    #[must_use]
    pub fn transitions_for(&self, saga_id: &SagaId) -> Vec<(SagaStatus, SagaStatus)> {
        self.state
            .lock()
            .map(|state| {
                state
                    .transitions
                    .iter()
                    .filter(|t| t.saga_id == *saga_id)
                    .map(|t| (t.from, t.to))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, instance: &SagaInstance) -> Result<(), SagaError> {
        let mut state = self.lock()?;
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &SagaInstance) -> Result<(), SagaError> {
        let mut state = self.lock()?;
        if !state.instances.contains_key(&instance.id) {
            return Err(SagaError::NotFound);
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: &SagaId) -> Result<Option<SagaInstance>, SagaError> {
        let state = self.lock()?;
        Ok(state.instances.get(id).cloned())
    }

    async fn find_by_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<SagaInstance>, SagaError> {
        let state = self.lock()?;
        Ok(state
            .instances
            .values()
            .find(|instance| instance.data_str("booking_id") == Some(booking_id))
            .cloned())
    }

    async fn record_transition(
        &self,
        saga_id: &SagaId,
        from: SagaStatus,
        to: SagaStatus,
        note: Option<&str>,
    ) -> Result<(), SagaError> {
        let mut state = self.lock()?;
        state.transitions.push(Transition {
            saga_id: *saga_id,
            from,
            to,
            note: note.map(str::to_string),
        });
        Ok(())
    }

    async fn push_dead_letter(&self, letter: &NewDeadLetter) -> Result<i64, SagaError> {
        let mut state = self.lock()?;
        let id = state.dead_letters.len() as i64 + 1;
        state.dead_letters.push(DeadLetter {
            id,
            saga_id: letter.saga_id,
            topic: letter.topic.clone(),
            message_key: letter.message_key.clone(),
            message_value: letter.message_value.clone(),
            error_message: letter.error_message.clone(),
            retry_count: letter.retry_count,
            created_at: Utc::now(),
            processed_at: None,
            processed: false,
        });
        Ok(id)
    }

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, SagaError> {
        let state = self.lock()?;
        Ok(state
            .dead_letters
            .iter()
            .filter(|letter| !letter.processed)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn mark_dead_letter_processed(&self, id: i64) -> Result<(), SagaError> {
        let mut state = self.lock()?;
        if let Some(letter) = state.dead_letters.iter_mut().find(|letter| letter.id == id) {
            letter.processed = true;
            letter.processed_at = Some(Utc::now());
        }
        Ok(())
    }
}
