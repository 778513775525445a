//! Router configuration.

use crate::api::{bookings, health, queue};
use crate::state::AppState;
use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Build the complete router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Virtual queue
        .route("/queue/join", post(queue::join_queue))
        .route("/queue/position/{event_id}", get(queue::get_position))
        .route("/queue/leave", delete(queue::leave_queue))
        .route("/queue/status/{event_id}", get(queue::queue_status))
        // Bookings
        .route("/bookings/reserve", post(bookings::reserve))
        .route("/bookings/{id}/confirm", post(bookings::confirm))
        .route(
            "/bookings/{id}",
            get(bookings::get_booking).delete(bookings::cancel),
        )
        .route("/bookings", get(bookings::list_bookings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
