//! Queue admission orchestration on top of a [`QueueStore`].
//!
//! Owns the policy the store does not: ready-threshold pass issuance, the
//! concurrent-admission cap, wait estimation, and batch promotion.

use crate::pass::PassSigner;
use crate::store::{EventQueueConfig, JoinOutcome, QueueError, QueueStore};
use chrono::{DateTime, Duration, Utc};
use stampede_core::clock::Clock;
use stampede_core::types::{EventId, UserId};
use std::sync::Arc;

/// Tunables for the admission controller.
#[derive(Clone, Debug)]
pub struct QueueControllerConfig {
    /// Queue entry lifetime in seconds (default 1800).
    pub entry_ttl_seconds: u64,
    /// Pass lifetime in seconds (default 300); per-event config overrides.
    pub pass_ttl_seconds: u64,
    /// Queue size cap; 0 disables the cap.
    pub max_queue_size: u64,
    /// Positions at or below this are "ready" for a pass (default 1).
    pub ready_threshold: u64,
    /// Seconds of estimated wait per position ahead, for client pacing.
    pub seconds_per_position: u64,
}

impl Default for QueueControllerConfig {
    fn default() -> Self {
        Self {
            entry_ttl_seconds: 1800,
            pass_ttl_seconds: 300,
            max_queue_size: 0,
            ready_threshold: 1,
            seconds_per_position: 5,
        }
    }
}

/// Result of joining a queue, including the leave token.
#[derive(Clone, Debug)]
pub struct JoinedQueue {
    /// 1-indexed position.
    pub position: u64,
    /// Queue size after joining.
    pub total: u64,
    /// Token required to leave the queue voluntarily.
    pub token: String,
}

/// Position lookup result, with a pass when the user is admitted.
#[derive(Clone, Debug)]
pub struct PositionInfo {
    /// 1-indexed position, `None` when not queued.
    pub position: Option<u64>,
    /// Total users waiting.
    pub total_in_queue: u64,
    /// Coarse wait estimate for polling cadence.
    pub estimated_wait_seconds: u64,
    /// Whether the user cleared the ready threshold.
    pub is_ready: bool,
    /// The queue pass, present only when issued (or still outstanding).
    pub queue_pass: Option<String>,
    /// Expiry of the returned pass.
    pub queue_pass_expires_at: Option<DateTime<Utc>>,
}

/// Public queue counters for an event.
#[derive(Clone, Debug)]
pub struct QueueStatus {
    /// Total users waiting.
    pub total_in_queue: u64,
    /// False once the size cap is reached.
    pub is_open: bool,
}

/// The virtual queue admission controller.
pub struct QueueController {
    store: Arc<dyn QueueStore>,
    signer: PassSigner,
    clock: Arc<dyn Clock>,
    config: QueueControllerConfig,
}

impl QueueController {
    /// Create a controller over a store.
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        signer: PassSigner,
        clock: Arc<dyn Clock>,
        config: QueueControllerConfig,
    ) -> Self {
        Self {
            store,
            signer,
            clock,
            config,
        }
    }

    /// Join the waiting room for an event.
    ///
    /// # Errors
    ///
    /// [`QueueError::AlreadyInQueue`], [`QueueError::QueueFull`], or
    /// [`QueueError::Store`].
    pub async fn join_queue(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<JoinedQueue, QueueError> {
        let token = uuid::Uuid::new_v4().to_string();
        let JoinOutcome { position, total, .. } = self
            .store
            .join(
                event_id,
                user_id,
                &token,
                self.config.entry_ttl_seconds,
                self.config.max_queue_size,
            )
            .await?;

        Ok(JoinedQueue {
            position,
            total,
            token,
        })
    }

    /// Look up a user's position; at the ready threshold this mints a pass,
    /// subject to the per-event concurrent-admission cap.
    ///
    /// Issuing a pass removes the user from the waiting room; the pass is
    /// their admission from here on.
    ///
    /// # Errors
    ///
    /// [`QueueError::PassNotIssued`] when the user is ready but the pass
    /// could not be recorded, or [`QueueError::Store`].
    pub async fn get_position(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<PositionInfo, QueueError> {
        // An already-issued pass keeps admitting until it expires, even
        // though the user left the ordered set when it was minted.
        if let Some(existing) = self.store.get_pass(event_id, user_id).await? {
            let expires_at = self.signer.peek_expiry(&existing);
            let total_in_queue = self.store.queue_len(event_id).await?;
            return Ok(PositionInfo {
                position: None,
                total_in_queue,
                estimated_wait_seconds: 0,
                is_ready: true,
                queue_pass: Some(existing),
                queue_pass_expires_at: expires_at,
            });
        }

        let position = self.store.position(event_id, user_id).await?;
        let Some(rank) = position.position else {
            return Ok(PositionInfo {
                position: None,
                total_in_queue: position.total,
                estimated_wait_seconds: 0,
                is_ready: false,
                queue_pass: None,
                queue_pass_expires_at: None,
            });
        };

        if rank > self.config.ready_threshold {
            return Ok(PositionInfo {
                position: Some(rank),
                total_in_queue: position.total,
                estimated_wait_seconds: rank.saturating_sub(1) * self.config.seconds_per_position,
                is_ready: false,
                queue_pass: None,
                queue_pass_expires_at: None,
            });
        }

        // Ready. Enforce the concurrent-admission cap before minting.
        let event_config = self.store.get_config(event_id).await?;
        if let Some(EventQueueConfig {
            max_concurrent_bookings,
            ..
        }) = event_config
        {
            if max_concurrent_bookings > 0 {
                let outstanding = self.store.count_active_passes(event_id).await?;
                if outstanding >= u64::from(max_concurrent_bookings) {
                    tracing::debug!(
                        event_id = %event_id,
                        user_id = %user_id,
                        outstanding,
                        cap = max_concurrent_bookings,
                        "admission cap reached, holding user at the front"
                    );
                    return Ok(PositionInfo {
                        position: Some(rank),
                        total_in_queue: position.total,
                        estimated_wait_seconds: self.config.seconds_per_position,
                        is_ready: false,
                        queue_pass: None,
                        queue_pass_expires_at: None,
                    });
                }
            }
        }

        let (pass, expires_at) = self.issue_pass(event_id, user_id, event_config).await?;
        self.store.evict(event_id, user_id).await?;
        let total_in_queue = self.store.queue_len(event_id).await?;

        Ok(PositionInfo {
            position: Some(rank),
            total_in_queue,
            estimated_wait_seconds: 0,
            is_ready: true,
            queue_pass: Some(pass),
            queue_pass_expires_at: Some(expires_at),
        })
    }

    /// Leave the waiting room voluntarily.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotInQueue`], [`QueueError::InvalidQueueToken`], or
    /// [`QueueError::Store`].
    pub async fn leave_queue(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        token: &str,
    ) -> Result<(), QueueError> {
        self.store.leave(event_id, user_id, token).await
    }

    /// Pop up to `count` users off the front and issue each a pass, driven
    /// by [`crate::admission::AdmissionLoop`].
    ///
    /// The batch is clamped to the free slots under the per-event
    /// concurrent-admission cap before anyone is popped, so promotion can
    /// never breach the cap. Users whose pass cannot be stored are skipped
    /// (they will rejoin).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults while popping.
    pub async fn promote(
        &self,
        event_id: &EventId,
        count: u64,
    ) -> Result<Vec<UserId>, QueueError> {
        let event_config = self.store.get_config(event_id).await?;

        let slots = match event_config {
            Some(config) if config.max_concurrent_bookings > 0 => {
                let outstanding = self.store.count_active_passes(event_id).await?;
                u64::from(config.max_concurrent_bookings).saturating_sub(outstanding)
            },
            _ => count,
        };
        let batch = count.min(slots);
        if batch == 0 {
            tracing::debug!(event_id = %event_id, "admission cap reached, promoting nobody");
            return Ok(Vec::new());
        }

        let users = self.store.pop_front(event_id, batch).await?;

        let mut admitted = Vec::with_capacity(users.len());
        for user_id in users {
            match self.issue_pass(event_id, &user_id, event_config).await {
                Ok(_) => admitted.push(user_id),
                Err(error) => {
                    tracing::warn!(
                        event_id = %event_id,
                        user_id = %user_id,
                        error = %error,
                        "failed to issue pass during promotion, user dropped from batch"
                    );
                },
            }
        }
        Ok(admitted)
    }

    /// Validate a presented pass: signature, expiry, and equality with the
    /// stored canonical value.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    pub async fn validate_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        pass: &str,
    ) -> Result<bool, QueueError> {
        if !self.signer.verify(pass, user_id, event_id) {
            return Ok(false);
        }
        let stored = self.store.get_pass(event_id, user_id).await?;
        Ok(stored.as_deref() == Some(pass))
    }

    /// Delete a pass after it was spent on a successful booking.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    pub async fn delete_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<(), QueueError> {
        self.store.delete_pass(event_id, user_id).await
    }

    /// Outstanding passes for an event (bounded count).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    pub async fn count_active_passes(&self, event_id: &EventId) -> Result<u64, QueueError> {
        self.store.count_active_passes(event_id).await
    }

    /// Public counters for the status endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    pub async fn queue_status(&self, event_id: &EventId) -> Result<QueueStatus, QueueError> {
        let total_in_queue = self.store.queue_len(event_id).await?;
        let is_open = self.config.max_queue_size == 0 || total_in_queue < self.config.max_queue_size;
        Ok(QueueStatus {
            total_in_queue,
            is_open,
        })
    }

    /// Cache per-event admission configuration (written through from the
    /// catalog service).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on transport faults.
    pub async fn set_event_config(
        &self,
        event_id: &EventId,
        config: &EventQueueConfig,
    ) -> Result<(), QueueError> {
        self.store.set_config(event_id, config).await
    }

    /// Mint a pass and record it; a pass the store cannot hold is reported
    /// as not issued rather than handed out.
    async fn issue_pass(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        event_config: Option<EventQueueConfig>,
    ) -> Result<(String, DateTime<Utc>), QueueError> {
        let ttl_seconds = event_config
            .map(|config| u64::from(config.queue_pass_ttl_minutes) * 60)
            .filter(|&ttl| ttl > 0)
            .unwrap_or(self.config.pass_ttl_seconds);

        let now = self.clock.now();
        #[allow(clippy::cast_possible_wrap)]
        let ttl = Duration::seconds(ttl_seconds as i64);

        let pass = self
            .signer
            .mint(user_id, event_id, now, ttl)
            .map_err(|e| QueueError::Store(format!("failed to sign pass: {e}")))?;

        if let Err(error) = self.store.put_pass(event_id, user_id, &pass, ttl_seconds).await {
            tracing::error!(
                event_id = %event_id,
                user_id = %user_id,
                error = %error,
                "pass could not be recorded, reporting as not issued"
            );
            return Err(QueueError::PassNotIssued);
        }

        tracing::info!(event_id = %event_id, user_id = %user_id, ttl_seconds, "queue pass issued");
        Ok((pass, now + ttl))
    }
}
