//! Application state shared across HTTP handlers.

use stampede_booking::ReservationService;
use stampede_booking::store::BookingStore;
use stampede_inventory::InventoryStore;
use stampede_queue::QueueController;
use std::sync::Arc;

/// Shared resources for the HTTP surface, cloned cheaply per request.
#[derive(Clone)]
pub struct AppState {
    /// Admission controller for the queue endpoints.
    pub queue: Arc<QueueController>,
    /// Reservation orchestration for the booking endpoints.
    pub reservations: Arc<ReservationService>,
    /// Booking ledger, for reads and the confirm path.
    pub bookings: Arc<dyn BookingStore>,
    /// Inventory engine, for the confirm path.
    pub inventory: Arc<dyn InventoryStore>,
}
