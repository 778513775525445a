//! # Stampede Queue
//!
//! The virtual queue admission controller: a fair, position-ordered waiting
//! room that throttles the rate at which users reach the inventory engine.
//!
//! # Fairness
//!
//! Join order equals FIFO order by join timestamp. Two users whose joins
//! interleave are still totally ordered; the store's single-threaded
//! evaluator is the sequencer. Score ties resolve by the store's tie-break
//! rule, stable within a boot.
//!
//! # Queue passes
//!
//! When a user reaches the ready threshold (position 1 by default), the
//! controller mints a signed, short-lived capability bound to
//! `(user, event)`. The canonical value lives in the store with a TTL; a
//! pass the store could not record is reported as not issued, never handed
//! to the user. Validation checks signature, expiry, and stored-value
//! equality; the pass is deleted on successful booking.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod controller;
pub mod keys;
pub mod memory;
pub mod pass;
pub mod redis;
pub mod store;

pub use admission::AdmissionLoop;
pub use controller::{PositionInfo, QueueController, QueueControllerConfig, QueueStatus};
pub use pass::PassSigner;
pub use store::{EventQueueConfig, JoinOutcome, QueueError, QueuePosition, QueueStore};
