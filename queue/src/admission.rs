//! Periodic batch admission.
//!
//! Position polling already admits the front user one at a time; this loop
//! is the bulk path for scheduled sales: every tick it promotes a batch off
//! the front of each configured event queue, bounded by the per-event
//! concurrent-admission cap (enforced inside
//! [`QueueController::promote`]).
//!
//! The event list comes from configuration; flash sales are scheduled, so
//! operators list the events being paced.

use crate::controller::QueueController;
use stampede_core::types::EventId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The batch admission loop.
pub struct AdmissionLoop {
    controller: Arc<QueueController>,
    events: Vec<EventId>,
    interval: Duration,
    batch: u64,
}

impl AdmissionLoop {
    /// Create a loop promoting `batch` users per event per tick.
    #[must_use]
    pub fn new(
        controller: Arc<QueueController>,
        events: Vec<EventId>,
        interval: Duration,
        batch: u64,
    ) -> Self {
        Self {
            controller,
            events,
            interval,
            batch,
        }
    }

    /// Run until the shutdown channel flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                events = ?self.events.iter().map(EventId::as_str).collect::<Vec<_>>(),
                interval_ms = self.interval.as_millis(),
                batch = self.batch,
                "admission loop started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("admission loop stopping");
                            break;
                        }
                    },
                }
            }
        })
    }

    async fn tick(&self) {
        for event_id in &self.events {
            match self.controller.promote(event_id, self.batch).await {
                Ok(admitted) if !admitted.is_empty() => {
                    tracing::info!(
                        event_id = %event_id,
                        admitted = admitted.len(),
                        "batch admission"
                    );
                },
                Ok(_) => {},
                Err(error) => {
                    tracing::error!(
                        event_id = %event_id,
                        error = %error,
                        "batch admission failed"
                    );
                },
            }
        }
    }
}
