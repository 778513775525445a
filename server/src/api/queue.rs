//! Queue endpoints: join, position, leave, status.

use crate::error::AppError;
use crate::identity::GatewayIdentity;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stampede_core::types::EventId;

/// Request to join an event queue.
#[derive(Debug, Deserialize)]
pub struct JoinQueueRequest {
    /// Event to queue for.
    pub event_id: String,
}

/// Response after joining.
#[derive(Debug, Serialize)]
pub struct JoinQueueResponse {
    /// 1-indexed position.
    pub position: u64,
    /// Queue size after joining.
    pub total: u64,
    /// Token required to leave voluntarily.
    pub token: String,
}

/// Position lookup response.
#[derive(Debug, Serialize)]
pub struct PositionResponse {
    /// 1-indexed position; absent when not queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    /// Total users waiting.
    pub total_in_queue: u64,
    /// Coarse wait estimate for polling cadence.
    pub estimated_wait_seconds: u64,
    /// Whether the user may proceed to reserve.
    pub is_ready: bool,
    /// The queue pass, present once admitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_pass: Option<String>,
    /// Expiry of the pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_pass_expires_at: Option<DateTime<Utc>>,
}

/// Request to leave a queue.
#[derive(Debug, Deserialize)]
pub struct LeaveQueueRequest {
    /// Event to leave.
    pub event_id: String,
    /// Token handed out on join.
    pub token: String,
}

/// Response after leaving.
#[derive(Debug, Serialize)]
pub struct LeaveQueueResponse {
    /// Always true on 200.
    pub success: bool,
    /// Human-readable confirmation.
    pub message: String,
}

/// Public queue counters.
#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    /// The event.
    pub event_id: String,
    /// Total users waiting.
    pub total_in_queue: u64,
    /// False once the size cap is reached.
    pub is_open: bool,
}

fn parse_event_id(raw: &str) -> Result<EventId, AppError> {
    if raw.is_empty() {
        return Err(AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "event_id is required".to_string(),
            "INVALID_EVENT_ID".to_string(),
        ));
    }
    Ok(EventId::new(raw))
}

/// POST /queue/join
pub async fn join_queue(
    identity: GatewayIdentity,
    State(state): State<AppState>,
    Json(request): Json<JoinQueueRequest>,
) -> Result<Json<JoinQueueResponse>, AppError> {
    let event_id = parse_event_id(&request.event_id)?;

    let joined = state
        .queue
        .join_queue(&event_id, &identity.user_id)
        .await?;

    Ok(Json(JoinQueueResponse {
        position: joined.position,
        total: joined.total,
        token: joined.token,
    }))
}

/// GET /queue/position/{event_id}
///
/// Reaching the front mints the queue pass; the response carries it.
pub async fn get_position(
    identity: GatewayIdentity,
    Path(event_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PositionResponse>, AppError> {
    let event_id = parse_event_id(&event_id)?;

    let info = state
        .queue
        .get_position(&event_id, &identity.user_id)
        .await?;

    Ok(Json(PositionResponse {
        position: info.position,
        total_in_queue: info.total_in_queue,
        estimated_wait_seconds: info.estimated_wait_seconds,
        is_ready: info.is_ready,
        queue_pass: info.queue_pass,
        queue_pass_expires_at: info.queue_pass_expires_at,
    }))
}

/// DELETE /queue/leave
pub async fn leave_queue(
    identity: GatewayIdentity,
    State(state): State<AppState>,
    Json(request): Json<LeaveQueueRequest>,
) -> Result<Json<LeaveQueueResponse>, AppError> {
    let event_id = parse_event_id(&request.event_id)?;

    state
        .queue
        .leave_queue(&event_id, &identity.user_id, &request.token)
        .await?;

    Ok(Json(LeaveQueueResponse {
        success: true,
        message: "left queue".to_string(),
    }))
}

/// GET /queue/status/{event_id}
pub async fn queue_status(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<QueueStatusResponse>, AppError> {
    let parsed = parse_event_id(&event_id)?;
    let status = state.queue.queue_status(&parsed).await?;

    Ok(Json(QueueStatusResponse {
        event_id,
        total_in_queue: status.total_in_queue,
        is_open: status.is_open,
    }))
}
