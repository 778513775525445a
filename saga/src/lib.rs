//! # Stampede Saga
//!
//! The post-payment booking saga: an event-driven orchestrator that, after
//! payment succeeds, confirms the booking and sends notification, and on
//! failure executes reverse-order compensating actions with a dead-letter
//! queue for poison messages.
//!
//! # Shape of the saga
//!
//! The definition carries four steps. The first two completed before the
//! saga existed (in the request path and the payment service) and are
//! recorded as completed at creation so their compensators participate in
//! rollback:
//!
//! | Step | Kind | On failure |
//! |------|------|------------|
//! | `reserve-seats` | pre-completed | compensator: release seats |
//! | `process-payment` | pre-completed | compensator: refund |
//! | `confirm-booking` | CRITICAL | compensate completed steps in reverse: refund, then release |
//! | `send-notification` | NON-CRITICAL | retry, then DLQ; the saga still completes |
//!
//! A customer who paid keeps their ticket: infrastructure flakes in
//! notification never roll back upstream state.
//!
//! # Ordering
//!
//! All saga traffic is partitioned by saga id, so each instance sees its
//! own messages in order; across instances there is no ordering guarantee
//! and none is assumed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod definition;
pub mod instance;
pub mod memory;
pub mod messages;
pub mod orchestrator;
pub mod postgres;
pub mod store;
pub mod workers;

pub use definition::{SagaDefinition, StepDef, steps};
pub use instance::{SagaInstance, SagaStatus, StepResult, StepStatus};
pub use orchestrator::SagaOrchestrator;
pub use store::{DeadLetter, NewDeadLetter, SagaError, SagaStore};
