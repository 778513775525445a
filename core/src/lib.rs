//! # Stampede Core
//!
//! Shared contracts for the Stampede flash-sale booking core.
//!
//! This crate carries everything the subsystem crates agree on without
//! depending on each other:
//!
//! - **Domain identifiers and the booking model** ([`types`])
//! - **The bus message envelope** ([`message`]): JSON messages with the
//!   `event_type` / `event_id` / `source` / `saga_id` / `idempotency_key`
//!   header set used on every topic
//! - **The [`event_bus::EventBus`] trait** implemented by the Kafka and
//!   in-memory buses
//! - **Clock abstraction** ([`clock`]) for deterministic tests
//! - **Retry machinery** ([`retry`]) and **failure classification**
//!   ([`failure`]) shared by the saga workers and the outbox relay
//!
//! Nothing in here performs I/O except the futures returned by the
//! [`event_bus::EventBus`] trait objects.

pub use chrono::{DateTime, Utc};

pub mod clock;
pub mod event_bus;
pub mod failure;
pub mod message;
pub mod retry;
pub mod types;
