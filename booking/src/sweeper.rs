//! Expiration sweeper: reconciles lapsed reservations between the
//! inventory store and the booking ledger.
//!
//! The only component that turns a TTL lapse into a durable `expired` row.
//! Each tick scans the ledger for `reserved` rows past their expiry,
//! releases the seat hold, and flips the row; the ledger stages
//! `booking.expired` in the same transaction and the outbox relay
//! delivers it.

use crate::store::{BookingError, BookingStore};
use stampede_inventory::{InventoryError, InventoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Counters from one sweep tick, for logs and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Lapsed `reserved` rows the scan returned.
    pub scanned: usize,
    /// Rows flipped to `expired`.
    pub expired: usize,
    /// Seat holds actually released (TTL may have beaten us to some).
    pub released: usize,
    /// Rows skipped because payment confirmed the hold first.
    pub confirmed_won: usize,
}

/// The periodic sweeper.
pub struct ExpirationSweeper {
    bookings: Arc<dyn BookingStore>,
    inventory: Arc<dyn InventoryStore>,
    interval: Duration,
    batch_limit: i64,
}

impl ExpirationSweeper {
    /// Create a sweeper; `interval` defaults to 10 s in the server config.
    #[must_use]
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        inventory: Arc<dyn InventoryStore>,
        interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            bookings,
            inventory,
            interval,
            batch_limit,
        }
    }

    /// Run until the shutdown channel flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = self.interval.as_secs(),
                batch_limit = self.batch_limit,
                "expiration sweeper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(stats) if stats.scanned > 0 => {
                                tracing::info!(
                                    scanned = stats.scanned,
                                    expired = stats.expired,
                                    released = stats.released,
                                    confirmed_won = stats.confirmed_won,
                                    "sweep completed"
                                );
                            },
                            Ok(_) => {},
                            Err(error) => {
                                tracing::error!(error = %error, "sweep failed");
                            },
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("expiration sweeper stopping");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// One sweep pass. Public so tests can drive ticks directly.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Database`] if the expiry scan itself fails;
    /// per-booking failures are logged and skipped.
    pub async fn sweep_once(&self) -> Result<SweepStats, BookingError> {
        let lapsed = self
            .bookings
            .get_expired_reservations(self.batch_limit)
            .await?;

        let mut stats = SweepStats {
            scanned: lapsed.len(),
            ..SweepStats::default()
        };

        for booking in lapsed {
            match self
                .inventory
                .release_seats(&booking.id, &booking.user_id)
                .await
            {
                Ok(_) => stats.released += 1,
                // TTL already dropped the record; counters were reconciled
                // by its release path or are unreachable, flip the row.
                Err(InventoryError::ReservationNotFound) => {},
                // Payment arrived first. Leave the booking for the confirm
                // worker.
                Err(InventoryError::AlreadyConfirmed) => {
                    stats.confirmed_won += 1;
                    continue;
                },
                Err(error) => {
                    tracing::error!(
                        booking_id = %booking.id,
                        error = %error,
                        "failed to release lapsed hold, will retry next tick"
                    );
                    continue;
                },
            }

            match self
                .bookings
                .mark_expired(&booking.id, "reservation window elapsed")
                .await
            {
                Ok(_) => {
                    stats.expired += 1;
                    metrics::counter!("bookings_expired_total").increment(1);
                },
                // Lost a race against confirm/cancel between the scan and
                // the flip; nothing to do.
                Err(
                    BookingError::AlreadyConfirmed
                    | BookingError::AlreadyCancelled
                    | BookingError::AlreadyExpired,
                ) => {},
                Err(error) => {
                    tracing::error!(
                        booking_id = %booking.id,
                        error = %error,
                        "failed to mark booking expired"
                    );
                },
            }
        }

        Ok(stats)
    }
}
