//! HTTP error type bridging domain errors to responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stampede_booking::{BookingError, ReservationError};
use stampede_queue::QueueError;
use std::fmt;

/// Application error type for HTTP handlers.
///
/// Wraps domain errors with the status and stable code the three error
/// tiers prescribe: domain rejections map to 4xx with their own codes,
/// transient infrastructure faults to 5xx, and saga-internal failures never
/// reach this type at all.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: String,
    #[allow(dead_code)]
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Attach the underlying error for server-side logging.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), "INVALID_INPUT".to_string())
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// 503 Service Unavailable (transient infrastructure tier).
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message.into(),
            "SERVICE_UNAVAILABLE".to_string(),
        )
    }

    fn coded(status: StatusCode, code: &str, message: String) -> Self {
        Self::new(status, message, code.to_string())
    }
}

impl From<ReservationError> for AppError {
    fn from(error: ReservationError) -> Self {
        let code = error.code();
        let message = error.to_string();
        match &error {
            ReservationError::InvalidInput(_) => {
                Self::coded(StatusCode::BAD_REQUEST, code, message)
            },
            ReservationError::QueuePassRequired | ReservationError::InvalidQueuePass => {
                Self::coded(StatusCode::FORBIDDEN, code, message)
            },
            ReservationError::UnknownZone => Self::coded(StatusCode::NOT_FOUND, code, message),
            ReservationError::Catalog(_) => Self::unavailable(message),
            ReservationError::Inventory(inventory) => {
                use stampede_inventory::InventoryError as IE;
                match inventory {
                    IE::InvalidQuantity => Self::coded(StatusCode::BAD_REQUEST, code, message),
                    IE::ZoneNotFound | IE::ReservationNotFound => {
                        Self::coded(StatusCode::NOT_FOUND, code, message)
                    },
                    IE::UserLimitExceeded | IE::InsufficientStock | IE::AlreadyConfirmed => {
                        Self::coded(StatusCode::CONFLICT, code, message)
                    },
                    IE::UserMismatch => Self::coded(StatusCode::FORBIDDEN, code, message),
                    IE::Store(_) => Self::unavailable(message),
                }
            },
            ReservationError::Store(store) => Self::from(store.clone()),
            ReservationError::Queue(queue) => Self::from(queue.clone()),
        }
    }
}

impl From<BookingError> for AppError {
    fn from(error: BookingError) -> Self {
        let code = error.code();
        let message = error.to_string();
        match error {
            BookingError::NotFound => Self::coded(StatusCode::NOT_FOUND, code, message),
            BookingError::AlreadyConfirmed
            | BookingError::AlreadyCancelled
            | BookingError::AlreadyExpired
            | BookingError::DuplicateIdempotencyKey => {
                Self::coded(StatusCode::CONFLICT, code, message)
            },
            BookingError::Database(_) => Self::unavailable(message),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(error: QueueError) -> Self {
        let code = error.code();
        let message = error.to_string();
        match error {
            QueueError::AlreadyInQueue { .. } | QueueError::QueueFull => {
                Self::coded(StatusCode::CONFLICT, code, message)
            },
            QueueError::NotInQueue => Self::coded(StatusCode::NOT_FOUND, code, message),
            QueueError::InvalidQueueToken => Self::coded(StatusCode::FORBIDDEN, code, message),
            QueueError::PassNotIssued | QueueError::Store(_) => Self::unavailable(message),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = %self.code,
                message = %self.message,
                "request failed"
            );
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("an internal error occurred").with_source(err)
    }
}
