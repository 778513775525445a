//! Admission-flow tests for the queue controller over the in-memory store.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use stampede_core::clock::{FixedClock, SystemClock};
use stampede_core::types::{EventId, UserId};
use stampede_queue::memory::InMemoryQueueStore;
use stampede_queue::{
    EventQueueConfig, PassSigner, QueueController, QueueControllerConfig, QueueError,
};

fn controller_over(store: Arc<InMemoryQueueStore>) -> QueueController {
    QueueController::new(
        store,
        PassSigner::new(b"admission-test-secret"),
        Arc::new(SystemClock),
        QueueControllerConfig::default(),
    )
}

#[tokio::test]
async fn front_user_gets_a_pass_and_leaves_the_queue() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(Arc::clone(&store));
    let event = EventId::new("onsale");

    let first = UserId::new("u1");
    let second = UserId::new("u2");
    controller.join_queue(&event, &first).await.unwrap();
    controller.join_queue(&event, &second).await.unwrap();

    let info = controller.get_position(&event, &first).await.unwrap();
    assert!(info.is_ready);
    let pass = info.queue_pass.unwrap();
    assert!(info.queue_pass_expires_at.is_some());

    // The admitted user left the ordered set; the next user is now first.
    let next = controller.get_position(&event, &second).await.unwrap();
    assert!(next.is_ready, "second user should now be at the front");

    // The pass validates until spent.
    assert!(controller.validate_pass(&event, &first, &pass).await.unwrap());
    controller.delete_pass(&event, &first).await.unwrap();
    assert!(!controller.validate_pass(&event, &first, &pass).await.unwrap());
}

#[tokio::test]
async fn waiting_users_see_position_and_estimate() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(store);
    let event = EventId::new("onsale");

    for i in 1..=4 {
        controller
            .join_queue(&event, &UserId::new(format!("u{i}")))
            .await
            .unwrap();
    }

    let info = controller
        .get_position(&event, &UserId::new("u4"))
        .await
        .unwrap();
    assert_eq!(info.position, Some(4));
    assert!(!info.is_ready);
    assert!(info.queue_pass.is_none());
    assert_eq!(info.estimated_wait_seconds, 15); // 3 ahead * 5s
}

#[tokio::test]
async fn admission_cap_holds_the_front_user() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(Arc::clone(&store));
    let event = EventId::new("onsale");

    controller
        .set_event_config(
            &event,
            &EventQueueConfig {
                max_concurrent_bookings: 1,
                queue_pass_ttl_minutes: 0,
            },
        )
        .await
        .unwrap();

    let first = UserId::new("u1");
    let second = UserId::new("u2");
    controller.join_queue(&event, &first).await.unwrap();
    controller.join_queue(&event, &second).await.unwrap();

    // First admission fills the cap.
    let info = controller.get_position(&event, &first).await.unwrap();
    assert!(info.is_ready);

    // Second user is at the front but held back by the cap.
    let held = controller.get_position(&event, &second).await.unwrap();
    assert_eq!(held.position, Some(1));
    assert!(!held.is_ready);
    assert!(held.queue_pass.is_none());

    // Spending the first pass frees a slot.
    controller.delete_pass(&event, &first).await.unwrap();
    let admitted = controller.get_position(&event, &second).await.unwrap();
    assert!(admitted.is_ready);
}

#[tokio::test]
async fn promote_admits_in_fifo_order() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(Arc::clone(&store));
    let event = EventId::new("onsale");

    for i in 0..5 {
        controller
            .join_queue(&event, &UserId::new(format!("u{i}")))
            .await
            .unwrap();
    }

    let admitted = controller.promote(&event, 2).await.unwrap();
    assert_eq!(admitted, vec![UserId::new("u0"), UserId::new("u1")]);
    assert_eq!(controller.count_active_passes(&event).await.unwrap(), 2);

    let status = controller.queue_status(&event).await.unwrap();
    assert_eq!(status.total_in_queue, 3);
    assert!(status.is_open);
}

#[tokio::test]
async fn promote_never_breaches_the_admission_cap() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(Arc::clone(&store));
    let event = EventId::new("onsale");

    controller
        .set_event_config(
            &event,
            &EventQueueConfig {
                max_concurrent_bookings: 2,
                queue_pass_ttl_minutes: 0,
            },
        )
        .await
        .unwrap();

    for i in 0..5 {
        controller
            .join_queue(&event, &UserId::new(format!("u{i}")))
            .await
            .unwrap();
    }

    // A batch of 5 is clamped to the 2 free slots; the rest keep waiting.
    let admitted = controller.promote(&event, 5).await.unwrap();
    assert_eq!(admitted, vec![UserId::new("u0"), UserId::new("u1")]);
    assert_eq!(controller.count_active_passes(&event).await.unwrap(), 2);
    assert_eq!(controller.queue_status(&event).await.unwrap().total_in_queue, 3);

    // Cap full: nobody is popped, let alone admitted.
    assert!(controller.promote(&event, 5).await.unwrap().is_empty());
    assert_eq!(controller.queue_status(&event).await.unwrap().total_in_queue, 3);

    // Spending a pass frees a slot for the next batch.
    controller.delete_pass(&event, &UserId::new("u0")).await.unwrap();
    let admitted = controller.promote(&event, 5).await.unwrap();
    assert_eq!(admitted, vec![UserId::new("u2")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_loop_drains_the_queue() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = Arc::new(controller_over(Arc::clone(&store)));
    let event = EventId::new("onsale");

    for i in 0..4 {
        controller
            .join_queue(&event, &UserId::new(format!("u{i}")))
            .await
            .unwrap();
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = stampede_queue::AdmissionLoop::new(
        Arc::clone(&controller),
        vec![event.clone()],
        std::time::Duration::from_millis(20),
        2,
    )
    .spawn(shutdown_rx);

    // Two ticks are enough for a batch of 2 to drain four users.
    let mut drained = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if controller.queue_status(&event).await.unwrap().total_in_queue == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "admission loop did not drain the queue");
    assert_eq!(controller.count_active_passes(&event).await.unwrap(), 4);

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
}

#[tokio::test]
async fn per_event_ttl_override_applies_to_minted_passes() {
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let store = Arc::new(InMemoryQueueStore::with_clock(clock.clone()));
    let controller = QueueController::new(
        Arc::clone(&store) as Arc<dyn stampede_queue::QueueStore>,
        PassSigner::new(b"admission-test-secret"),
        clock.clone(),
        QueueControllerConfig::default(),
    );
    let event = EventId::new("onsale");
    let user = UserId::new("u1");

    controller
        .set_event_config(
            &event,
            &EventQueueConfig {
                max_concurrent_bookings: 0,
                queue_pass_ttl_minutes: 2,
            },
        )
        .await
        .unwrap();

    controller.join_queue(&event, &user).await.unwrap();
    let info = controller.get_position(&event, &user).await.unwrap();
    let pass = info.queue_pass.unwrap();

    assert!(controller.validate_pass(&event, &user, &pass).await.unwrap());

    // The stored copy lapses at the 2-minute override, not the 5-minute default.
    clock.advance_secs(121);
    assert!(!controller.validate_pass(&event, &user, &pass).await.unwrap());
}

#[tokio::test]
async fn pass_bound_to_other_user_or_event_is_rejected() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(store);
    let event = EventId::new("onsale");
    let user = UserId::new("u1");

    controller.join_queue(&event, &user).await.unwrap();
    let pass = controller
        .get_position(&event, &user)
        .await
        .unwrap()
        .queue_pass
        .unwrap();

    assert!(
        !controller
            .validate_pass(&event, &UserId::new("u2"), &pass)
            .await
            .unwrap()
    );
    assert!(
        !controller
            .validate_pass(&EventId::new("other"), &user, &pass)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn leave_errors_map_to_codes() {
    let store = Arc::new(InMemoryQueueStore::new());
    let controller = controller_over(store);
    let event = EventId::new("onsale");
    let user = UserId::new("u1");

    let joined = controller.join_queue(&event, &user).await.unwrap();
    assert_eq!(
        controller
            .leave_queue(&event, &user, "bogus")
            .await
            .unwrap_err(),
        QueueError::InvalidQueueToken
    );
    controller
        .leave_queue(&event, &user, &joined.token)
        .await
        .unwrap();
    assert_eq!(
        controller
            .leave_queue(&event, &user, &joined.token)
            .await
            .unwrap_err(),
        QueueError::NotInQueue
    );
}
