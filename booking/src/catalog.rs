//! Catalog provider seam.
//!
//! The catalog service owns events, shows, zones, and pricing; this crate
//! only needs three lookups from it. [`StaticCatalog`] is the in-process
//! implementation used for development and tests; production deployments
//! put their catalog client behind the same trait.

use async_trait::async_trait;
use stampede_core::types::{EventId, ZoneId};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Catalog lookup failure (transport or upstream fault).
#[derive(Error, Debug, Clone)]
#[error("catalog unavailable: {0}")]
pub struct CatalogError(pub String);

/// Read-side catalog lookups needed by the reservation path.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Unit price for a zone in minor units, `None` for unknown zones.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the catalog cannot be reached.
    async fn zone_unit_price_cents(
        &self,
        event_id: &EventId,
        zone_id: &ZoneId,
    ) -> Result<Option<i64>, CatalogError>;

    /// Per-user purchase cap for an event, `None` to use the service default.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the catalog cannot be reached.
    async fn max_per_user(&self, event_id: &EventId) -> Result<Option<u32>, CatalogError>;

    /// Whether reservations for this event require a queue pass.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the catalog cannot be reached.
    async fn queue_pass_required(&self, event_id: &EventId) -> Result<bool, CatalogError>;
}

/// In-process catalog with per-event overrides.
pub struct StaticCatalog {
    prices: RwLock<HashMap<(String, String), i64>>,
    caps: RwLock<HashMap<String, u32>>,
    pass_required: RwLock<HashMap<String, bool>>,
    pass_required_default: bool,
}

impl StaticCatalog {
    /// Create an empty catalog; `pass_required_default` applies to events
    /// without an explicit setting.
    #[must_use]
    pub fn new(pass_required_default: bool) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            caps: RwLock::new(HashMap::new()),
            pass_required: RwLock::new(HashMap::new()),
            pass_required_default,
        }
    }

    /// Set a zone's unit price.
    pub fn set_zone_price(&self, event_id: &EventId, zone_id: &ZoneId, cents: i64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert((event_id.to_string(), zone_id.to_string()), cents);
        }
    }

    /// Set an event's per-user cap.
    pub fn set_max_per_user(&self, event_id: &EventId, cap: u32) {
        if let Ok(mut caps) = self.caps.write() {
            caps.insert(event_id.to_string(), cap);
        }
    }

    /// Set an event's queue-pass requirement.
    pub fn set_queue_pass_required(&self, event_id: &EventId, required: bool) {
        if let Ok(mut map) = self.pass_required.write() {
            map.insert(event_id.to_string(), required);
        }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn zone_unit_price_cents(
        &self,
        event_id: &EventId,
        zone_id: &ZoneId,
    ) -> Result<Option<i64>, CatalogError> {
        Ok(self
            .prices
            .read()
            .map_err(|_| CatalogError("price table poisoned".to_string()))?
            .get(&(event_id.to_string(), zone_id.to_string()))
            .copied())
    }

    async fn max_per_user(&self, event_id: &EventId) -> Result<Option<u32>, CatalogError> {
        Ok(self
            .caps
            .read()
            .map_err(|_| CatalogError("cap table poisoned".to_string()))?
            .get(event_id.as_str())
            .copied())
    }

    async fn queue_pass_required(&self, event_id: &EventId) -> Result<bool, CatalogError> {
        Ok(self
            .pass_required
            .read()
            .map_err(|_| CatalogError("pass table poisoned".to_string()))?
            .get(event_id.as_str())
            .copied()
            .unwrap_or(self.pass_required_default))
    }
}
