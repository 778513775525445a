//! Post-payment saga tests over the in-memory bus and stores.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stampede_booking::memory::InMemoryBookingStore;
use stampede_booking::store::{BookingStore, NewBooking};
use stampede_bus::memory::InMemoryEventBus;
use stampede_bus::topics::{self, event_types};
use stampede_core::clock::{Clock, SystemClock};
use stampede_core::event_bus::EventBus;
use stampede_core::message::BusMessage;
use stampede_core::retry::RetryPolicy;
use stampede_core::types::{
    BookingId, BookingStatus, EventId, ShowId, TenantId, UserId, ZoneId,
};
use stampede_inventory::memory::InMemoryInventoryStore;
use stampede_inventory::{InventoryStore, ReserveParams};
use stampede_queue::memory::InMemoryQueueStore;
use stampede_queue::{PassSigner, QueueController, QueueControllerConfig};
use stampede_saga::definition::steps;
use stampede_saga::memory::InMemorySagaStore;
use stampede_saga::messages::PaymentOutcome;
use stampede_saga::workers::{
    CommandHandler, CompensationWorker, ConfirmBookingWorker, NotificationWorker, Notifier,
    NotifyError, StepWorkerContext, spawn_worker,
};
use stampede_saga::{SagaDefinition, SagaOrchestrator, SagaStatus, SagaStore};

struct Harness {
    inventory: Arc<InMemoryInventoryStore>,
    bookings: Arc<InMemoryBookingStore>,
    bus: Arc<InMemoryEventBus>,
    saga_store: Arc<InMemorySagaStore>,
    queue: Arc<QueueController>,
    orchestrator: Arc<SagaOrchestrator>,
}

fn worker_ctx(h: &Harness, max_retries: u32) -> StepWorkerContext {
    StepWorkerContext {
        bus: Arc::clone(&h.bus) as Arc<dyn EventBus>,
        saga_store: Arc::clone(&h.saga_store) as Arc<dyn SagaStore>,
        backoff: RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .jitter(false)
            .build(),
        max_retries,
        source: "test-worker",
    }
}

fn harness() -> Harness {
    let inventory = Arc::new(InMemoryInventoryStore::new());
    let bookings = Arc::new(InMemoryBookingStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let saga_store = Arc::new(InMemorySagaStore::new());
    let queue = Arc::new(QueueController::new(
        Arc::new(InMemoryQueueStore::new()),
        PassSigner::new(b"saga-test-secret"),
        Arc::new(SystemClock),
        QueueControllerConfig::default(),
    ));

    let orchestrator = Arc::new(SagaOrchestrator::new(
        SagaDefinition::booking(),
        Arc::clone(&saga_store) as Arc<dyn SagaStore>,
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
    ));

    Harness {
        inventory,
        bookings,
        bus,
        saga_store,
        queue,
        orchestrator,
    }
}

fn confirm_worker(h: &Harness) -> ConfirmBookingWorker {
    ConfirmBookingWorker::new(
        Arc::clone(&h.bookings) as Arc<dyn BookingStore>,
        Arc::clone(&h.inventory) as Arc<dyn InventoryStore>,
        Arc::clone(&h.queue),
        worker_ctx(h, 3),
    )
}

fn compensation_worker(h: &Harness) -> CompensationWorker {
    CompensationWorker::new(
        Arc::clone(&h.inventory) as Arc<dyn InventoryStore>,
        Arc::clone(&h.bus) as Arc<dyn EventBus>,
        worker_ctx(h, 3),
    )
}

/// Reserve seats in the engine and write the matching ledger row.
async fn reserved_booking(h: &Harness, user: &str) -> BookingId {
    let booking_id = BookingId::new();
    let zone = ZoneId::new("vip");
    if h.inventory.zone_availability(&zone).await.unwrap().is_none() {
        h.inventory.seed_zone(&zone, 100).await.unwrap();
    }
    h.inventory
        .reserve_seats(&ReserveParams {
            booking_id,
            zone_id: zone.clone(),
            user_id: UserId::new(user),
            event_id: EventId::new("onsale"),
            quantity: 2,
            max_per_user: 10,
            unit_price_cents: 5000,
            ttl_seconds: 600,
        })
        .await
        .unwrap();

    h.bookings
        .create(&NewBooking {
            id: booking_id,
            tenant_id: TenantId::new("t1"),
            user_id: UserId::new(user),
            event_id: EventId::new("onsale"),
            show_id: ShowId::new("night-1"),
            zone_id: zone,
            quantity: 2,
            unit_price_cents: 5000,
            currency: "USD".to_string(),
            idempotency_key: None,
            reservation_expires_at: Utc::now() + chrono::Duration::seconds(600),
        })
        .await
        .unwrap();

    booking_id
}

fn payment_success(booking_id: BookingId, user: &str) -> BusMessage {
    BusMessage::new(
        event_types::PAYMENT_SUCCESS,
        "payment-service",
        &PaymentOutcome {
            booking_id,
            user_id: user.to_string(),
            payment_id: "pay-1".to_string(),
            amount_cents: Some(10_000),
        },
    )
    .unwrap()
}

/// Handle every message on a command topic exactly once, including the
/// republished retries a failing handler appends.
async fn drain_commands(h: &Harness, worker: &dyn CommandHandler, topic: &str) {
    let mut handled = 0;
    loop {
        let pending = h.bus.published_on(topic);
        if handled >= pending.len() {
            break;
        }
        let message = pending[handled].clone();
        worker.handle(&message).await;
        handled += 1;
    }
}

async fn saga_for(h: &Harness, booking_id: BookingId) -> stampede_saga::SagaInstance {
    h.saga_store
        .find_by_booking(&booking_id.to_string())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn happy_path_confirms_notifies_and_completes() {
    let h = harness();
    let booking_id = reserved_booking(&h, "u1").await;

    h.orchestrator
        .dispatch(&payment_success(booking_id, "u1"))
        .await
        .unwrap();

    // The orchestrator recorded the pre-completed context and commanded
    // confirm-booking.
    let saga = saga_for(&h, booking_id).await;
    assert_eq!(saga.status, SagaStatus::Running);
    assert!(saga.has_result_for(steps::RESERVE_SEATS));
    assert!(saga.has_result_for(steps::PROCESS_PAYMENT));

    let confirm = confirm_worker(&h);
    drain_commands(&h, &confirm, &topics::saga_command(steps::CONFIRM_BOOKING)).await;

    // The worker reported success; feed it back to the orchestrator.
    let success = h
        .bus
        .published_on(&topics::saga_success(steps::CONFIRM_BOOKING))
        .pop()
        .unwrap();
    h.orchestrator.dispatch(&success).await.unwrap();

    // Booking is durably confirmed.
    let booking = h.bookings.get_by_id(&booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert!(booking.confirmation_code.is_some());

    // Notification command went out, carrying the confirmation code.
    let notification = NotificationWorker::new(Arc::new(LogOk), worker_ctx(&h, 5));
    let cmd_topic = topics::saga_command(steps::SEND_NOTIFICATION);
    let command = h.bus.published_on(&cmd_topic).pop().unwrap();
    assert!(
        command
            .decode::<stampede_saga::messages::StepCommand>()
            .unwrap()
            .context
            .contains_key("confirmation_code")
    );
    notification.handle(&command).await;

    let success = h
        .bus
        .published_on(&topics::saga_success(steps::SEND_NOTIFICATION))
        .pop()
        .unwrap();
    h.orchestrator.dispatch(&success).await.unwrap();

    let saga = saga_for(&h, booking_id).await;
    assert_eq!(saga.status, SagaStatus::Completed);
    assert!(saga.completed_at.is_some());

    // Lifecycle trail: started then completed.
    assert_eq!(
        h.bus
            .published_on(&topics::saga_lifecycle("started"))
            .len(),
        1
    );
    assert_eq!(
        h.bus
            .published_on(&topics::saga_lifecycle("completed"))
            .len(),
        1
    );
}

struct LogOk;

#[async_trait]
impl Notifier for LogOk {
    async fn send_booking_confirmation(
        &self,
        _user_id: &str,
        _booking_id: &BookingId,
        _confirmation_code: Option<&str>,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Notifier that fails every delivery with a retryable error.
struct AlwaysDown {
    attempts: AtomicUsize,
}

#[async_trait]
impl Notifier for AlwaysDown {
    async fn send_booking_confirmation(
        &self,
        _user_id: &str,
        _booking_id: &BookingId,
        _confirmation_code: Option<&str>,
    ) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::retryable("smtp connection refused"))
    }
}

/// Critical-step failure compensates in reverse: refund, then release.
#[tokio::test]
async fn critical_failure_compensates_refund_then_release() {
    let h = harness();

    // A payment arrives for a booking the ledger has never seen: the
    // confirm step fails non-retryably.
    let booking_id = BookingId::new();
    h.orchestrator
        .dispatch(&payment_success(booking_id, "u1"))
        .await
        .unwrap();

    let confirm = confirm_worker(&h);
    drain_commands(&h, &confirm, &topics::saga_command(steps::CONFIRM_BOOKING)).await;

    // Exactly one attempt: not-found is not worth retrying.
    assert_eq!(
        h.bus
            .published_on(&topics::saga_command(steps::CONFIRM_BOOKING))
            .len(),
        1
    );

    let failure = h
        .bus
        .published_on(&topics::saga_failure(steps::CONFIRM_BOOKING))
        .pop()
        .unwrap();
    h.orchestrator.dispatch(&failure).await.unwrap();

    let saga = saga_for(&h, booking_id).await;
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(saga.completed_at.is_some());

    // Each compensator commanded exactly once, refund before release.
    let refund_topic = topics::saga_command("compensate-process-payment");
    let release_topic = topics::saga_command("compensate-reserve-seats");
    assert_eq!(h.bus.published_on(&refund_topic).len(), 1);
    assert_eq!(h.bus.published_on(&release_topic).len(), 1);

    let order: Vec<String> = h
        .bus
        .published()
        .into_iter()
        .map(|entry| entry.topic)
        .filter(|topic| *topic == refund_topic || *topic == release_topic)
        .collect();
    assert_eq!(order, vec![refund_topic.clone(), release_topic.clone()]);

    // The compensation worker relays the refund to the payment service.
    let compensation = compensation_worker(&h);
    drain_commands(&h, &compensation, &refund_topic).await;
    drain_commands(&h, &compensation, &release_topic).await;

    let refunds: Vec<String> = h.bus.event_types_on(topics::PAYMENT_EVENTS);
    assert!(refunds.contains(&event_types::PAYMENT_REFUND_REQUESTED.to_string()));

    // The booking row was never confirmed.
    assert!(h.bookings.get_by_id(&booking_id).await.unwrap().is_none());
    // No forward notification was ever commanded.
    assert!(
        h.bus
            .published_on(&topics::saga_command(steps::SEND_NOTIFICATION))
            .is_empty()
    );
}

/// Non-critical failure dead-letters and the saga still completes; the
/// customer keeps their ticket.
#[tokio::test]
async fn notification_failure_dead_letters_and_saga_completes() {
    let h = harness();
    let booking_id = reserved_booking(&h, "u1").await;

    h.orchestrator
        .dispatch(&payment_success(booking_id, "u1"))
        .await
        .unwrap();

    let confirm = confirm_worker(&h);
    drain_commands(&h, &confirm, &topics::saga_command(steps::CONFIRM_BOOKING)).await;
    let success = h
        .bus
        .published_on(&topics::saga_success(steps::CONFIRM_BOOKING))
        .pop()
        .unwrap();
    h.orchestrator.dispatch(&success).await.unwrap();

    // Notification fails on every attempt; budget of 5 retries.
    let notifier = Arc::new(AlwaysDown {
        attempts: AtomicUsize::new(0),
    });
    let notification = NotificationWorker::new(
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        worker_ctx(&h, 5),
    );
    let cmd_topic = topics::saga_command(steps::SEND_NOTIFICATION);
    drain_commands(&h, &notification, &cmd_topic).await;

    // Initial attempt + 5 retries.
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 6);

    let failure = h
        .bus
        .published_on(&topics::saga_failure(steps::SEND_NOTIFICATION))
        .pop()
        .unwrap();
    h.orchestrator.dispatch(&failure).await.unwrap();

    // Saga completed despite the failed step.
    let saga = saga_for(&h, booking_id).await;
    assert_eq!(saga.status, SagaStatus::Completed);

    // A dead letter holds the poisoned command and the final error.
    let letters = h.saga_store.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].topic, cmd_topic);
    assert!(letters[0].error_message.contains("smtp connection refused"));
    assert_eq!(letters[0].retry_count, 5);

    // The booking stays confirmed; no compensation was emitted.
    let booking = h.bookings.get_by_id(&booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert!(
        h.bus
            .published_on(&topics::saga_command("compensate-process-payment"))
            .is_empty()
    );
    assert!(
        h.bus
            .published_on(&topics::saga_command("compensate-reserve-seats"))
            .is_empty()
    );
}

/// Duplicate deliveries neither double-start sagas nor double-apply steps.
#[tokio::test]
async fn duplicate_messages_are_dropped() {
    let h = harness();
    let booking_id = reserved_booking(&h, "u1").await;

    let payment = payment_success(booking_id, "u1");
    h.orchestrator.dispatch(&payment).await.unwrap();
    h.orchestrator.dispatch(&payment).await.unwrap();

    // One saga, one confirm command.
    assert_eq!(
        h.bus
            .published_on(&topics::saga_command(steps::CONFIRM_BOOKING))
            .len(),
        1
    );

    let confirm = confirm_worker(&h);
    let command = h
        .bus
        .published_on(&topics::saga_command(steps::CONFIRM_BOOKING))
        .pop()
        .unwrap();
    confirm.handle(&command).await;
    // Redelivery of the same command converges on the same state.
    confirm.handle(&command).await;

    let booking = h.bookings.get_by_id(&booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);

    let success = h
        .bus
        .published_on(&topics::saga_success(steps::CONFIRM_BOOKING))
        .first()
        .cloned()
        .unwrap();
    h.orchestrator.dispatch(&success).await.unwrap();
    h.orchestrator.dispatch(&success).await.unwrap();

    // Only one notification command despite the duplicate success event.
    assert_eq!(
        h.bus
            .published_on(&topics::saga_command(steps::SEND_NOTIFICATION))
            .len(),
        1
    );
}

/// A step with no outcome by its deadline is treated as failed.
#[tokio::test]
async fn step_timeout_triggers_compensation() {
    let h = harness();
    let booking_id = reserved_booking(&h, "u1").await;

    h.orchestrator
        .dispatch(&payment_success(booking_id, "u1"))
        .await
        .unwrap();

    // The scheduled check, with its deadline already in the past; no
    // worker ever ran.
    let check = h
        .bus
        .published_on(topics::SAGA_TIMEOUT_CHECK)
        .pop()
        .unwrap();
    let mut expired = check
        .decode::<stampede_saga::messages::TimeoutCheck>()
        .unwrap();
    expired.deadline = Utc::now() - chrono::Duration::seconds(1);
    let expired_message = BusMessage::new(
        topics::SAGA_TIMEOUT_CHECK,
        "test",
        &expired,
    )
    .unwrap();

    h.orchestrator.dispatch(&expired_message).await.unwrap();

    // The watcher task fires immediately for past deadlines.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let saga = saga_for(&h, booking_id).await;
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(
        h.bus
            .published_on(&topics::saga_command("compensate-process-payment"))
            .len(),
        1
    );
}

/// Full pipeline through spawned consumer loops.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_with_spawned_workers() {
    let h = harness();
    let booking_id = reserved_booking(&h, "u1").await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let orchestrator_handle = Arc::clone(&h.orchestrator).spawn(shutdown_rx.clone());
    let confirm_handle = spawn_worker(
        Arc::new(confirm_worker(&h)),
        Arc::clone(&h.bus) as Arc<dyn EventBus>,
        shutdown_rx.clone(),
    );
    let notify_handle = spawn_worker(
        Arc::new(NotificationWorker::new(Arc::new(LogOk), worker_ctx(&h, 5))),
        Arc::clone(&h.bus) as Arc<dyn EventBus>,
        shutdown_rx.clone(),
    );

    // Let the consumers subscribe before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let payment = payment_success(booking_id, "u1");
    h.bus
        .publish(
            topics::PAYMENT_EVENTS,
            &booking_id.to_string(),
            &payment,
        )
        .await
        .unwrap();

    // Poll for completion.
    let mut completed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(saga) = h
            .saga_store
            .find_by_booking(&booking_id.to_string())
            .await
            .unwrap()
        {
            if saga.status == SagaStatus::Completed {
                completed = true;
                break;
            }
        }
    }
    assert!(completed, "saga did not complete in time");

    let booking = h.bookings.get_by_id(&booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), orchestrator_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), confirm_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), notify_handle).await;
}
