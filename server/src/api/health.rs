//! Health and readiness endpoints.

use axum::Json;
use serde::Serialize;

/// Health response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` when the process is up.
    pub status: &'static str,
}

/// GET /health: liveness.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /ready: readiness. The stores fail fast on first use; a process
/// that accepted the listener is ready to take traffic.
pub async fn readiness_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
