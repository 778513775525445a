//! Step workers: consume saga commands, execute the underlying operation,
//! and report success or failure back to the orchestrator.
//!
//! All workers share the same retry discipline: a retryable failure is
//! republished to the same topic with an incremented `retry_count` header
//! after a jittered backoff; a non-retryable failure or an exhausted budget
//! writes a dead letter and emits a failure event.

pub mod compensation;
pub mod confirm;
pub mod notification;

pub use compensation::CompensationWorker;
pub use confirm::ConfirmBookingWorker;
pub use notification::{LogNotifier, NotificationWorker, Notifier, NotifyError};

use crate::messages::{StepCommand, StepFailed, StepSucceeded};
use crate::store::{NewDeadLetter, SagaStore};
use async_trait::async_trait;
use futures::StreamExt;
use stampede_bus::topics;
use stampede_core::event_bus::EventBus;
use stampede_core::failure::FailureKind;
use stampede_core::message::BusMessage;
use stampede_core::retry::RetryPolicy;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A worker that consumes command topics.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Worker name for logs.
    fn name(&self) -> &'static str;

    /// Topics this worker consumes.
    fn topics(&self) -> Vec<String>;

    /// Handle one message. Errors are internal to the worker (reported via
    /// retry, DLQ, and failure events), never propagated to the consumer
    /// loop.
    async fn handle(&self, message: &BusMessage);
}

/// Run a worker's consumer loop until the shutdown channel flips to `true`.
pub fn spawn_worker(
    worker: Arc<dyn CommandHandler>,
    bus: Arc<dyn EventBus>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subscription = worker.topics();
        let topic_refs: Vec<&str> = subscription.iter().map(String::as_str).collect();

        let mut stream = match bus.subscribe(&topic_refs).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(worker = worker.name(), error = %error, "worker failed to subscribe");
                return;
            },
        };

        tracing::info!(worker = worker.name(), topics = ?subscription, "worker started");

        loop {
            tokio::select! {
                maybe = stream.next() => match maybe {
                    Some(Ok(message)) => worker.handle(&message).await,
                    Some(Err(error)) => {
                        tracing::warn!(worker = worker.name(), error = %error, "worker stream error");
                    },
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(worker = worker.name(), "worker stopping");
                        break;
                    }
                },
            }
        }
    })
}

/// Shared plumbing for reporting step outcomes.
pub struct StepWorkerContext {
    /// Bus for events, retries, and the DLQ topic.
    pub bus: Arc<dyn EventBus>,
    /// Store for dead letters.
    pub saga_store: Arc<dyn SagaStore>,
    /// Backoff pacing between retries.
    pub backoff: RetryPolicy,
    /// Retry budget for this worker's step.
    pub max_retries: u32,
    /// Source tag for emitted messages.
    pub source: &'static str,
}

impl StepWorkerContext {
    /// Emit the step success event.
    pub async fn report_success(
        &self,
        command: &StepCommand,
        data: serde_json::Map<String, serde_json::Value>,
    ) {
        let topic = topics::saga_success(&command.step);
        let event = StepSucceeded {
            saga_id: command.saga_id,
            step: command.step.clone(),
            data,
        };

        match BusMessage::new(&topic, self.source, &event) {
            Ok(message) => {
                let message = message.with_saga_id(command.saga_id);
                if let Err(error) = self
                    .bus
                    .publish(&topic, &command.saga_id.to_string(), &message)
                    .await
                {
                    // The orchestrator's timeout check covers a lost event.
                    tracing::error!(
                        saga_id = %command.saga_id,
                        step = %command.step,
                        error = %error,
                        "failed to publish success event"
                    );
                }
            },
            Err(error) => {
                tracing::error!(error = %error, "failed to encode success event");
            },
        }
    }

    /// Retry a retryable failure with backoff, or dead-letter it and
    /// (optionally) emit the failure event.
    pub async fn report_failure(
        &self,
        consumed_topic: &str,
        message: &BusMessage,
        command: &StepCommand,
        error: String,
        kind: FailureKind,
        emit_failure_event: bool,
    ) {
        if kind.is_retryable() && message.retry_count < self.max_retries {
            let delay = self.backoff.jittered_delay(message.retry_count);
            tracing::warn!(
                saga_id = %command.saga_id,
                step = %command.step,
                retry_count = message.retry_count,
                delay_ms = delay.as_millis(),
                error = %error,
                "step failed, republishing for retry"
            );
            metrics::counter!("saga_step_retries_total", "step" => command.step.clone())
                .increment(1);

            tokio::time::sleep(delay).await;
            let retried = message.next_attempt();
            if let Err(publish_error) = self
                .bus
                .publish(consumed_topic, &command.saga_id.to_string(), &retried)
                .await
            {
                tracing::error!(
                    saga_id = %command.saga_id,
                    error = %publish_error,
                    "failed to republish for retry, dead-lettering instead"
                );
                self.dead_letter(consumed_topic, message, command, &error).await;
                if emit_failure_event {
                    self.emit_failure_event(command, error, kind, message.retry_count)
                        .await;
                }
            }
            return;
        }

        tracing::error!(
            saga_id = %command.saga_id,
            step = %command.step,
            retry_count = message.retry_count,
            kind = kind.as_str(),
            error = %error,
            "step failed terminally"
        );
        self.dead_letter(consumed_topic, message, command, &error).await;
        if emit_failure_event {
            self.emit_failure_event(command, error, kind, message.retry_count)
                .await;
        }
    }

    async fn dead_letter(
        &self,
        consumed_topic: &str,
        message: &BusMessage,
        command: &StepCommand,
        error: &str,
    ) {
        let message_value = serde_json::to_value(message).unwrap_or_default();
        let letter = NewDeadLetter {
            saga_id: Some(command.saga_id),
            topic: consumed_topic.to_string(),
            message_key: command.saga_id.to_string(),
            message_value: message_value.clone(),
            error_message: error.to_string(),
            retry_count: i32::try_from(message.retry_count).unwrap_or(i32::MAX),
        };

        if let Err(store_error) = self.saga_store.push_dead_letter(&letter).await {
            tracing::error!(
                saga_id = %command.saga_id,
                error = %store_error,
                "failed to persist dead letter"
            );
        }

        // Mirror onto the DLQ topic for streaming consumers.
        let payload = serde_json::json!({
            "saga_id": command.saga_id,
            "topic": consumed_topic,
            "error": error,
            "retry_count": message.retry_count,
            "message": message_value,
        });
        match BusMessage::new("saga.dead-letter", self.source, &payload) {
            Ok(dlq_message) => {
                if let Err(publish_error) = self.bus.publish_nowait(
                    topics::SAGA_DLQ,
                    &command.saga_id.to_string(),
                    &dlq_message,
                ) {
                    tracing::error!(error = %publish_error, "failed to enqueue DLQ message");
                }
            },
            Err(encode_error) => {
                tracing::error!(error = %encode_error, "failed to encode DLQ message");
            },
        }
    }

    async fn emit_failure_event(
        &self,
        command: &StepCommand,
        error: String,
        kind: FailureKind,
        retry_count: u32,
    ) {
        let topic = topics::saga_failure(&command.step);
        let event = StepFailed {
            saga_id: command.saga_id,
            step: command.step.clone(),
            error,
            kind,
            retry_count,
        };

        match BusMessage::new(&topic, self.source, &event) {
            Ok(message) => {
                let message = message.with_saga_id(command.saga_id);
                if let Err(publish_error) = self
                    .bus
                    .publish(&topic, &command.saga_id.to_string(), &message)
                    .await
                {
                    tracing::error!(
                        saga_id = %command.saga_id,
                        error = %publish_error,
                        "failed to publish failure event"
                    );
                }
            },
            Err(encode_error) => {
                tracing::error!(error = %encode_error, "failed to encode failure event");
            },
        }
    }

    /// Decode a step command, dead-lettering undecodable (poison) messages.
    pub async fn decode_command(
        &self,
        consumed_topic: &str,
        message: &BusMessage,
    ) -> Option<StepCommand> {
        match message.decode::<StepCommand>() {
            Ok(command) => Some(command),
            Err(error) => {
                tracing::error!(
                    topic = consumed_topic,
                    event_id = %message.event_id,
                    error = %error,
                    "poison command message, dead-lettering"
                );
                let letter = NewDeadLetter {
                    saga_id: message.saga_id,
                    topic: consumed_topic.to_string(),
                    message_key: message.event_id.clone(),
                    message_value: serde_json::to_value(message).unwrap_or_default(),
                    error_message: error.to_string(),
                    retry_count: i32::try_from(message.retry_count).unwrap_or(i32::MAX),
                };
                if let Err(store_error) = self.saga_store.push_dead_letter(&letter).await {
                    tracing::error!(error = %store_error, "failed to persist poison dead letter");
                }
                None
            },
        }
    }
}

