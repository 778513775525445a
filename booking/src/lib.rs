//! # Stampede Booking
//!
//! The durable side of the booking core:
//!
//! - [`store::BookingStore`]: the booking ledger (Postgres + in-memory),
//!   including the idempotency-key index and the conditional state
//!   transitions of the booking state machine.
//! - [`service::ReservationService`]: orchestrates a single reserve
//!   request: queue-pass validation, atomic seat reservation, ledger write
//!   with rollback, and pass consumption. Lifecycle events are staged by
//!   the ledger inside its own transaction, never published inline.
//! - [`confirmation`]: the confirm path shared by the HTTP surface and the
//!   saga's confirm-booking worker.
//! - [`sweeper::ExpirationSweeper`]: reconciles lapsed reservations between
//!   the inventory store and the ledger.
//! - [`outbox`]: durable staging for events that must be published
//!   at least once after the owning transaction commits.
//!
//! # Booking state machine
//!
//! ```text
//! reserved ──confirm──► confirmed   (terminal for forward flow)
//!    │
//!    ├──cancel───► cancelled        (terminal)
//!    └──expire───► expired          (terminal)
//! ```
//!
//! Conditional transitions read the prior status in the same round trip, so
//! "row absent" and "row present in the wrong state" are distinguished
//! without a second read.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod confirmation;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod service;
pub mod store;
pub mod sweeper;

pub use catalog::{Catalog, CatalogError, StaticCatalog};
pub use service::{ReservationError, ReservationService, ReserveRequest, ReservedBooking};
pub use store::{BookingError, BookingStore, NewBooking};
