//! The saga orchestrator.
//!
//! Consumes `payment.events`, per-step success/failure events, and the
//! timeout-check topic; advances instances through the definition and runs
//! reverse-order compensation when a critical step fails.
//!
//! Handlers are idempotent: duplicate deliveries of `payment.success` or of
//! a step event are detected against stored state and dropped, so the bus's
//! at-least-once delivery never double-advances a saga.

use crate::definition::{SagaDefinition, StepDef};
use crate::instance::{SagaInstance, SagaStatus, StepStatus};
use crate::messages::{
    LifecycleEvent, PaymentOutcome, StepCommand, StepFailed, StepSucceeded, TimeoutCheck,
};
use crate::store::{SagaError, SagaStore};
use futures::StreamExt;
use serde_json::{Map, Value};
use stampede_bus::topics::{self, event_types};
use stampede_core::clock::Clock;
use stampede_core::event_bus::EventBus;
use stampede_core::message::BusMessage;
use stampede_core::types::BookingId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Message source tag stamped on emitted messages.
const SOURCE: &str = "saga-orchestrator";

/// Orchestrates post-payment booking sagas.
///
/// Cheap to clone (the definition is small, the rest are `Arc`s); timeout
/// watchers run on clones.
#[derive(Clone)]
pub struct SagaOrchestrator {
    definition: SagaDefinition,
    store: Arc<dyn SagaStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl SagaOrchestrator {
    /// Wire up the orchestrator.
    #[must_use]
    pub fn new(
        definition: SagaDefinition,
        store: Arc<dyn SagaStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            definition,
            store,
            bus,
            clock,
        }
    }

    /// Topics this orchestrator consumes.
    #[must_use]
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut subscription = vec![
            topics::PAYMENT_EVENTS.to_string(),
            topics::SAGA_TIMEOUT_CHECK.to_string(),
        ];
        for step in self.definition.executable_steps() {
            subscription.push(topics::saga_success(step.name));
            subscription.push(topics::saga_failure(step.name));
        }
        subscription
    }

    /// Consume until the shutdown channel flips to `true`.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let subscription = self.subscription_topics();
            let topic_refs: Vec<&str> = subscription.iter().map(String::as_str).collect();

            let mut stream = match self.bus.subscribe(&topic_refs).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(error = %error, "orchestrator failed to subscribe");
                    return;
                },
            };

            tracing::info!(topics = ?subscription, "saga orchestrator started");

            loop {
                tokio::select! {
                    maybe = stream.next() => match maybe {
                        Some(Ok(message)) => {
                            if let Err(error) = self.dispatch(&message).await {
                                tracing::error!(
                                    event_type = %message.event_type,
                                    error = %error,
                                    "failed to handle saga message"
                                );
                            }
                        },
                        Some(Err(error)) => {
                            tracing::warn!(error = %error, "saga stream error");
                        },
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("saga orchestrator stopping");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Route one message. Public so tests can drive the orchestrator
    /// without a consumer loop.
    ///
    /// # Errors
    ///
    /// Storage, bus, or codec faults; malformed messages of known types.
    pub async fn dispatch(&self, message: &BusMessage) -> Result<(), SagaError> {
        let event_type = message.event_type.as_str();

        if event_type == event_types::PAYMENT_SUCCESS {
            return self.start_saga(message).await;
        }
        if event_type == event_types::PAYMENT_FAILED {
            // Nothing to do: the booking stays reserved and the sweeper
            // expires it when the window lapses.
            tracing::debug!("payment failed, leaving reservation to expire");
            return Ok(());
        }
        if event_type == topics::SAGA_TIMEOUT_CHECK {
            self.schedule_timeout_watch(message)?;
            return Ok(());
        }

        for step in self.definition.executable_steps() {
            if event_type == topics::saga_success(step.name) {
                return self.on_step_success(message).await;
            }
            if event_type == topics::saga_failure(step.name) {
                return self.on_step_failure(message).await;
            }
        }

        tracing::trace!(event_type, "ignoring unrelated message");
        Ok(())
    }

    /// `payment.success`: create the instance and command the first step.
    async fn start_saga(&self, message: &BusMessage) -> Result<(), SagaError> {
        let payment: PaymentOutcome = message
            .decode()
            .map_err(|e| SagaError::Codec(e.to_string()))?;

        let booking_key = payment.booking_id.to_string();
        if let Some(existing) = self.store.find_by_booking(&booking_key).await? {
            tracing::debug!(
                saga_id = %existing.id,
                booking_id = %booking_key,
                "duplicate payment.success, saga already exists"
            );
            return Ok(());
        }

        let mut data = Map::new();
        data.insert("booking_id".to_string(), Value::String(booking_key.clone()));
        data.insert("user_id".to_string(), Value::String(payment.user_id.clone()));
        data.insert(
            "payment_id".to_string(),
            Value::String(payment.payment_id.clone()),
        );
        if let Some(amount) = payment.amount_cents {
            data.insert("amount_cents".to_string(), Value::from(amount));
        }

        let now = self.clock.now();
        let mut instance = SagaInstance::new(&self.definition, data, now);
        self.store.insert(&instance).await?;

        instance.status = SagaStatus::Running;
        instance.updated_at = now;
        self.store.update(&instance).await?;
        self.store
            .record_transition(&instance.id, SagaStatus::Pending, SagaStatus::Running, None)
            .await?;
        self.emit_lifecycle(&instance, "started");
        metrics::counter!("sagas_started_total").increment(1);

        tracing::info!(
            saga_id = %instance.id,
            booking_id = %booking_key,
            "saga started"
        );

        if let Some(first) = self.definition.first_executable() {
            self.send_step_command(&instance, first).await?;
        }
        Ok(())
    }

    /// Step success: merge output, record the result, advance.
    async fn on_step_success(&self, message: &BusMessage) -> Result<(), SagaError> {
        let outcome: StepSucceeded = message
            .decode()
            .map_err(|e| SagaError::Codec(e.to_string()))?;

        let Some(mut instance) = self.store.get(&outcome.saga_id).await? else {
            tracing::warn!(saga_id = %outcome.saga_id, "success event for unknown saga");
            return Ok(());
        };
        if !instance.status.accepts_forward_progress() {
            tracing::debug!(
                saga_id = %instance.id,
                status = instance.status.as_str(),
                "dropping success event for non-running saga"
            );
            return Ok(());
        }
        if instance.has_result_for(&outcome.step) {
            tracing::debug!(
                saga_id = %instance.id,
                step = %outcome.step,
                "dropping duplicate step event"
            );
            return Ok(());
        }

        instance.merge_data(&outcome.data);
        let now = self.clock.now();
        instance.record_step(
            &outcome.step,
            StepStatus::Completed,
            Value::Object(outcome.data),
            message.occurred_at,
            now,
            None,
        );

        tracing::info!(saga_id = %instance.id, step = %outcome.step, "step completed");
        self.advance_after(&mut instance, &outcome.step).await
    }

    /// Step failure: compensate (critical) or dead-letter-and-continue
    /// (non-critical; the worker already wrote the DLQ row).
    async fn on_step_failure(&self, message: &BusMessage) -> Result<(), SagaError> {
        let failure: StepFailed = message
            .decode()
            .map_err(|e| SagaError::Codec(e.to_string()))?;

        let Some(mut instance) = self.store.get(&failure.saga_id).await? else {
            tracing::warn!(saga_id = %failure.saga_id, "failure event for unknown saga");
            return Ok(());
        };
        if !instance.status.accepts_forward_progress() || instance.has_result_for(&failure.step) {
            return Ok(());
        }

        let Some(step) = self.definition.step(&failure.step) else {
            tracing::warn!(step = %failure.step, "failure event for unknown step");
            return Ok(());
        };
        let critical = step.critical;

        let now = self.clock.now();
        instance.record_step(
            &failure.step,
            StepStatus::Failed,
            Value::Null,
            message.occurred_at,
            now,
            Some(failure.error.clone()),
        );

        metrics::counter!("saga_steps_failed_total", "step" => step.name).increment(1);

        if critical {
            tracing::error!(
                saga_id = %instance.id,
                step = %failure.step,
                error = %failure.error,
                "critical step failed, compensating"
            );
            self.compensate(&mut instance, failure.error).await
        } else {
            // The customer already owns a valid ticket; infrastructure
            // flakes must not revoke it.
            tracing::warn!(
                saga_id = %instance.id,
                step = %failure.step,
                error = %failure.error,
                "non-critical step failed, continuing"
            );
            self.advance_after(&mut instance, &failure.step).await
        }
    }

    /// Record the step outcome, then either command the next step or
    /// complete the saga.
    async fn advance_after(
        &self,
        instance: &mut SagaInstance,
        after_step: &str,
    ) -> Result<(), SagaError> {
        if let Some(next) = self.definition.next_executable_after(after_step) {
            if let Some(index) = self.definition.step_index(next.name) {
                instance.current_step = index;
            }
            instance.updated_at = self.clock.now();
            self.store.update(instance).await?;
            self.send_step_command(instance, next).await
        } else {
            let from = instance.status;
            let now = self.clock.now();
            instance.status = SagaStatus::Completed;
            instance.completed_at = Some(now);
            instance.updated_at = now;
            self.store.update(instance).await?;
            self.store
                .record_transition(&instance.id, from, SagaStatus::Completed, None)
                .await?;
            self.emit_lifecycle(instance, "completed");
            metrics::counter!("sagas_completed_total").increment(1);
            tracing::info!(saga_id = %instance.id, "saga completed");
            Ok(())
        }
    }

    /// Reverse-order compensation, then `compensated`.
    ///
    /// Compensation commands are best-effort at this layer; each
    /// compensator is independently retry-capable.
    async fn compensate(
        &self,
        instance: &mut SagaInstance,
        error: String,
    ) -> Result<(), SagaError> {
        let from = instance.status;
        let now = self.clock.now();
        instance.status = SagaStatus::Compensating;
        instance.error = Some(error.clone());
        instance.updated_at = now;
        self.store.update(instance).await?;
        self.store
            .record_transition(&instance.id, from, SagaStatus::Compensating, Some(&error))
            .await?;
        self.emit_lifecycle(instance, "failed");

        for step in instance.compensatable_steps(&self.definition) {
            let Some(compensation) = step.compensation else {
                continue;
            };
            if let Err(publish_error) = self.send_compensation(instance, compensation).await {
                tracing::error!(
                    saga_id = %instance.id,
                    compensation,
                    error = %publish_error,
                    "failed to emit compensation command"
                );
            }
        }

        let now = self.clock.now();
        instance.status = SagaStatus::Compensated;
        instance.completed_at = Some(now);
        instance.updated_at = now;
        self.store.update(instance).await?;
        self.store
            .record_transition(
                &instance.id,
                SagaStatus::Compensating,
                SagaStatus::Compensated,
                None,
            )
            .await?;
        self.emit_lifecycle(instance, "compensated");
        metrics::counter!("sagas_compensated_total").increment(1);
        tracing::info!(saga_id = %instance.id, "saga compensated");
        Ok(())
    }

    /// Publish a step command and schedule its timeout check.
    async fn send_step_command(
        &self,
        instance: &SagaInstance,
        step: &StepDef,
    ) -> Result<(), SagaError> {
        let command = self.command_for(instance, step.name)?;
        let topic = topics::saga_command(step.name);
        let message = BusMessage::new(&topic, SOURCE, &command)
            .map_err(|e| SagaError::Codec(e.to_string()))?
            .with_saga_id(instance.id);

        self.bus
            .publish(&topic, &instance.id.to_string(), &message)
            .await
            .map_err(|e| SagaError::Bus(e.to_string()))?;

        let deadline = self.clock.now()
            + chrono::Duration::from_std(step.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let check = TimeoutCheck {
            saga_id: instance.id,
            step: step.name.to_string(),
            deadline,
        };
        let check_message = BusMessage::new(topics::SAGA_TIMEOUT_CHECK, SOURCE, &check)
            .map_err(|e| SagaError::Codec(e.to_string()))?
            .with_saga_id(instance.id);
        self.bus
            .publish(topics::SAGA_TIMEOUT_CHECK, &instance.id.to_string(), &check_message)
            .await
            .map_err(|e| SagaError::Bus(e.to_string()))?;

        tracing::debug!(saga_id = %instance.id, step = step.name, "step command sent");
        Ok(())
    }

    /// Publish a compensation command (no timeout watch; compensators are
    /// fire-and-forget best-effort at this layer).
    async fn send_compensation(
        &self,
        instance: &SagaInstance,
        compensation: &str,
    ) -> Result<(), SagaError> {
        let command = self.command_for(instance, compensation)?;
        let topic = topics::saga_command(compensation);
        let message = BusMessage::new(&topic, SOURCE, &command)
            .map_err(|e| SagaError::Codec(e.to_string()))?
            .with_saga_id(instance.id);

        self.bus
            .publish(&topic, &instance.id.to_string(), &message)
            .await
            .map_err(|e| SagaError::Bus(e.to_string()))?;

        tracing::info!(saga_id = %instance.id, compensation, "compensation command sent");
        Ok(())
    }

    fn command_for(&self, instance: &SagaInstance, step: &str) -> Result<StepCommand, SagaError> {
        let booking_id = instance
            .data_str("booking_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(BookingId::from_uuid)
            .ok_or_else(|| SagaError::Codec("saga data missing booking_id".to_string()))?;

        Ok(StepCommand {
            saga_id: instance.id,
            step: step.to_string(),
            booking_id,
            user_id: instance.data_str("user_id").unwrap_or_default().to_string(),
            payment_id: instance
                .data_str("payment_id")
                .unwrap_or_default()
                .to_string(),
            context: instance.data.clone(),
        })
    }

    /// Spawn a watcher that fires when the step's deadline passes. The
    /// watcher count is bounded by in-flight saga steps.
    fn schedule_timeout_watch(&self, message: &BusMessage) -> Result<(), SagaError> {
        let check: TimeoutCheck = message
            .decode()
            .map_err(|e| SagaError::Codec(e.to_string()))?;

        let orchestrator = self.clone();
        let delay = (check.deadline - self.clock.now())
            .to_std()
            .unwrap_or_default();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(error) = orchestrator.check_step_deadline(&check).await {
                tracing::error!(
                    saga_id = %check.saga_id,
                    step = %check.step,
                    error = %error,
                    "timeout check failed"
                );
            }
        });
        Ok(())
    }

    /// If the step produced no outcome by its deadline, treat it as failed.
    async fn check_step_deadline(&self, check: &TimeoutCheck) -> Result<(), SagaError> {
        let Some(mut instance) = self.store.get(&check.saga_id).await? else {
            return Ok(());
        };
        if !instance.status.accepts_forward_progress() || instance.has_result_for(&check.step) {
            return Ok(());
        }
        let current_name = self
            .definition
            .steps
            .get(instance.current_step)
            .map(|step| step.name);
        if current_name != Some(check.step.as_str()) {
            return Ok(());
        }

        let Some(step) = self.definition.step(&check.step) else {
            return Ok(());
        };

        tracing::warn!(
            saga_id = %instance.id,
            step = %check.step,
            "step produced no outcome by its deadline, treating as failed"
        );
        metrics::counter!("saga_step_timeouts_total", "step" => step.name).increment(1);

        let now = self.clock.now();
        instance.record_step(
            &check.step,
            StepStatus::Failed,
            Value::Null,
            check.deadline,
            now,
            Some("step timed out".to_string()),
        );

        if step.critical {
            self.compensate(&mut instance, "step timed out".to_string())
                .await
        } else {
            self.advance_after(&mut instance, &check.step).await
        }
    }

    fn emit_lifecycle(&self, instance: &SagaInstance, phase: &str) {
        let payload = LifecycleEvent {
            saga_id: instance.id,
            definition_id: instance.definition_id.clone(),
            status: instance.status.as_str().to_string(),
            error: instance.error.clone(),
        };
        let topic = topics::saga_lifecycle(phase);

        match BusMessage::new(&topic, SOURCE, &payload) {
            Ok(message) => {
                let message = message.with_saga_id(instance.id);
                if let Err(error) =
                    self.bus
                        .publish_nowait(&topic, &instance.id.to_string(), &message)
                {
                    tracing::error!(
                        saga_id = %instance.id,
                        phase,
                        error = %error,
                        "failed to enqueue lifecycle event"
                    );
                }
            },
            Err(error) => {
                tracing::error!(error = %error, "failed to encode lifecycle event");
            },
        }
    }
}
