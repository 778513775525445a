//! # Stampede Inventory
//!
//! The atomic seat-inventory engine: reserve, confirm, and release seats
//! with strict no-oversell and per-user-cap guarantees.
//!
//! # Atomicity model
//!
//! All three engine operations run as single scripts on a single-threaded
//! evaluator, so no interleaving is observable between two concurrent
//! callers touching the same zone:
//!
//! - [`redis::RedisInventoryStore`] evaluates one Lua script per operation;
//!   Redis's command loop is the sequencer.
//! - [`memory::InMemoryInventoryStore`] holds the whole state behind one
//!   mutex; the critical section is the script.
//!
//! Because no operation ever yields mid-script, the last-seat race resolves
//! with exactly one winner, deterministically by arrival order at the
//! evaluator.
//!
//! # State machine
//!
//! A reservation record moves `∅ → pending` on reserve, then either
//! `pending → confirmed` on confirm (TTL removed, seats stay consumed) or
//! `pending → ∅` on release or TTL expiry. The durable booking ledger is
//! reconciled by the expiration sweeper, not by this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod keys;
pub mod memory;
pub mod redis;
pub mod store;

pub use store::{
    ConfirmOutcome, InventoryError, InventoryStore, ReleaseOutcome, ReservationRecord,
    ReservationState, ReserveOutcome, ReserveParams,
};
