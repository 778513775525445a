//! Gateway identity extraction.
//!
//! Authentication happens upstream; the gateway injects the caller's
//! identity as headers. Handlers never see unauthenticated traffic.

use crate::error::AppError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use stampede_core::types::{TenantId, UserId};

/// Identity headers injected by the upstream gateway.
pub struct GatewayIdentity {
    /// The authenticated user.
    pub user_id: UserId,
    /// The tenant the request acts under.
    pub tenant_id: TenantId,
}

impl<S> FromRequestParts<S> for GatewayIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("X-User-Id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::bad_request("missing X-User-Id header"))?;

        let tenant_id = parts
            .headers
            .get("X-Tenant-Id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or("default");

        Ok(Self {
            user_id: UserId::new(user_id),
            tenant_id: TenantId::new(tenant_id),
        })
    }
}

/// Optional header helper for `X-Idempotency-Key` and `X-Queue-Pass`.
pub fn optional_header(parts: &axum::http::HeaderMap, name: &str) -> Option<String> {
    parts
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
