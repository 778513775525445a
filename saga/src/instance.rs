//! Durable saga instances and their state machine.

use crate::definition::SagaDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stampede_core::types::SagaId;
use thiserror::Error;

/// Saga lifecycle status.
///
/// `completed`, `compensated`, and `failed` are terminal. Once a saga is
/// `compensating`, no forward step may execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    /// Created, first command not yet sent.
    Pending,
    /// Advancing through forward steps.
    Running,
    /// All steps done.
    Completed,
    /// Irrecoverable without compensation (unused by the booking saga but
    /// part of the state machine).
    Failed,
    /// Reverse-order compensation in progress.
    Compensating,
    /// Compensation finished.
    Compensated,
}

/// Error returned when parsing a status string from storage.
#[derive(Error, Debug)]
#[error("invalid saga status: {0}")]
pub struct InvalidSagaStatus(pub String);

impl SagaStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSagaStatus`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, InvalidSagaStatus> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            other => Err(InvalidSagaStatus(other.to_string())),
        }
    }

    /// Whether this status accepts no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Compensated)
    }

    /// Whether the orchestrator may advance forward steps.
    #[must_use]
    pub const fn accepts_forward_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Outcome of one step execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// The worker reported success.
    Completed,
    /// The worker reported terminal failure (or the step timed out).
    Failed,
}

/// One entry in a saga's execution history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name from the definition.
    pub step_name: String,
    /// Completed or failed.
    pub status: StepStatus,
    /// Output data merged into the saga's data map.
    pub data: Value,
    /// When the step began (command sent / context recorded).
    pub started_at: DateTime<Utc>,
    /// When the outcome arrived.
    pub finished_at: DateTime<Utc>,
    /// Milliseconds between start and finish.
    pub duration_ms: i64,
    /// Error string for failed steps.
    pub error: Option<String>,
}

/// A durable saga instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Instance id; the partition key for all of this saga's messages.
    pub id: SagaId,
    /// Which definition this instance runs.
    pub definition_id: String,
    /// Lifecycle status.
    pub status: SagaStatus,
    /// Accumulated context (booking id, user id, payment id, step outputs).
    pub data: Map<String, Value>,
    /// Execution history, in completion order.
    pub step_results: Vec<StepResult>,
    /// Index into the definition's steps of the step currently in flight.
    pub current_step: usize,
    /// Terminal error, if any.
    pub error: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When the saga reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    /// Create a new instance with the definition's pre-completed steps
    /// already recorded, positioned at the first executable step.
    #[must_use]
    pub fn new(definition: &SagaDefinition, data: Map<String, Value>, now: DateTime<Utc>) -> Self {
        let step_results: Vec<StepResult> = definition
            .steps
            .iter()
            .filter(|step| step.pre_completed)
            .map(|step| StepResult {
                step_name: step.name.to_string(),
                status: StepStatus::Completed,
                data: Value::Null,
                started_at: now,
                finished_at: now,
                duration_ms: 0,
                error: None,
            })
            .collect();

        let current_step = definition
            .first_executable()
            .and_then(|step| definition.step_index(step.name))
            .unwrap_or(definition.steps.len());

        Self {
            id: SagaId::new(),
            definition_id: definition.id.to_string(),
            status: SagaStatus::Pending,
            data,
            step_results,
            current_step,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether the history already records an outcome for a step. Used to
    /// drop duplicate deliveries of step events.
    #[must_use]
    pub fn has_result_for(&self, step_name: &str) -> bool {
        self.step_results
            .iter()
            .any(|result| result.step_name == step_name)
    }

    /// Merge step output into the saga's data map (step keys win).
    pub fn merge_data(&mut self, output: &Map<String, Value>) {
        for (key, value) in output {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Append a step outcome to the history.
    pub fn record_step(
        &mut self,
        step_name: &str,
        status: StepStatus,
        data: Value,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) {
        self.step_results.push(StepResult {
            step_name: step_name.to_string(),
            status,
            data,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            error,
        });
        self.updated_at = finished_at;
    }

    /// Completed steps whose definition carries a compensator, in REVERSE
    /// completion order.
    #[must_use]
    pub fn compensatable_steps<'a>(
        &self,
        definition: &'a SagaDefinition,
    ) -> Vec<&'a crate::definition::StepDef> {
        self.step_results
            .iter()
            .rev()
            .filter(|result| result.status == StepStatus::Completed)
            .filter_map(|result| definition.step(&result.step_name))
            .filter(|step| step.compensation.is_some())
            .collect()
    }

    /// String value from the data map.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::definition::steps;

    fn booking_data() -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("booking_id".to_string(), Value::String("b-1".to_string()));
        data
    }

    #[test]
    fn new_instance_records_pre_completed_steps() {
        let definition = SagaDefinition::booking();
        let instance = SagaInstance::new(&definition, booking_data(), Utc::now());

        assert_eq!(instance.status, SagaStatus::Pending);
        assert_eq!(instance.step_results.len(), 2);
        assert!(instance.has_result_for(steps::RESERVE_SEATS));
        assert!(instance.has_result_for(steps::PROCESS_PAYMENT));
        assert_eq!(
            definition.steps[instance.current_step].name,
            steps::CONFIRM_BOOKING
        );
    }

    #[test]
    fn compensatable_steps_come_back_in_reverse_order() {
        let definition = SagaDefinition::booking();
        let instance = SagaInstance::new(&definition, booking_data(), Utc::now());

        let compensations: Vec<&str> = instance
            .compensatable_steps(&definition)
            .iter()
            .filter_map(|step| step.compensation)
            .collect();

        // Refund before release: reverse of reserve -> pay.
        assert_eq!(
            compensations,
            vec!["compensate-process-payment", "compensate-reserve-seats"]
        );
    }

    #[test]
    fn terminal_statuses_reject_forward_progress() {
        for status in [
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensated,
        ] {
            assert!(status.is_terminal());
            assert!(!status.accepts_forward_progress());
        }
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(!SagaStatus::Compensating.accepts_forward_progress());
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
        ] {
            assert_eq!(SagaStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SagaStatus::parse("bogus").is_err());
    }

    #[test]
    fn merge_data_overwrites_existing_keys() {
        let definition = SagaDefinition::booking();
        let mut instance = SagaInstance::new(&definition, booking_data(), Utc::now());

        let mut output = Map::new();
        output.insert(
            "confirmation_code".to_string(),
            Value::String("AB-12".to_string()),
        );
        output.insert("booking_id".to_string(), Value::String("b-2".to_string()));
        instance.merge_data(&output);

        assert_eq!(instance.data_str("confirmation_code"), Some("AB-12"));
        assert_eq!(instance.data_str("booking_id"), Some("b-2"));
    }
}
