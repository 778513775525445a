//! Stampede booking server.
//!
//! Wires the production stores (Redis inventory/queue, Postgres ledger and
//! saga state, Kafka bus) to the HTTP surface and the background machinery:
//! saga orchestrator, step workers, expiration sweeper, outbox relay, and
//! the batch admission loop for events listed in `ADMISSION_EVENTS`.
//!
//! Catalog data (zone seeding, prices, per-event caps) is owned by the
//! external catalog service; this process reads it through the [`Catalog`]
//! seam and the inventory store it seeds.

mod api;
mod config;
mod error;
mod identity;
mod metrics;
mod routes;
mod state;

use config::Config;
use sqlx::postgres::PgPoolOptions;
use stampede_booking::outbox::{OutboxRelay, OutboxStore, PostgresOutboxStore};
use stampede_booking::postgres::PostgresBookingStore;
use stampede_booking::service::{ReservationConfig, ReservationService};
use stampede_booking::store::BookingStore;
use stampede_booking::sweeper::ExpirationSweeper;
use stampede_booking::{Catalog, StaticCatalog};
use stampede_bus::KafkaEventBus;
use stampede_core::clock::{Clock, SystemClock};
use stampede_core::event_bus::EventBus;
use stampede_core::retry::RetryPolicy;
use stampede_core::types::EventId;
use stampede_inventory::InventoryStore;
use stampede_inventory::redis::RedisInventoryStore;
use stampede_queue::redis::RedisQueueStore;
use stampede_queue::{
    AdmissionLoop, PassSigner, QueueController, QueueControllerConfig, QueueStore,
};
use stampede_saga::workers::{
    CompensationWorker, ConfirmBookingWorker, LogNotifier, NotificationWorker, StepWorkerContext,
    spawn_worker,
};
use stampede_saga::{SagaDefinition, SagaOrchestrator, SagaStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stampede=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting stampede booking server");

    let config = Config::from_env();
    info!(
        postgres_url = %config.postgres.url,
        redis_url = %config.redis.url,
        kafka_brokers = %config.kafka.brokers,
        "configuration loaded"
    );

    metrics::register_business_metrics();
    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    metrics::install_exporter(metrics_addr)?;

    // Durable stores.
    info!("connecting to postgres");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await?;
    let bookings: Arc<dyn BookingStore> = Arc::new(PostgresBookingStore::new(pool.clone()));
    let saga_store: Arc<dyn SagaStore> =
        Arc::new(stampede_saga::postgres::PostgresSagaStore::new(pool.clone()));
    let outbox_store: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool));

    // Inventory and queue stores.
    info!("connecting to redis");
    let inventory: Arc<dyn InventoryStore> =
        Arc::new(RedisInventoryStore::new(&config.redis.url).await?);
    let queue_store: Arc<dyn QueueStore> =
        Arc::new(RedisQueueStore::new(&config.redis.url).await?);

    // Event bus.
    info!("connecting to kafka");
    let bus: Arc<dyn EventBus> = Arc::new(
        KafkaEventBus::builder()
            .brokers(&config.kafka.brokers)
            .consumer_group(&config.kafka.consumer_group)
            .timeout(Duration::from_millis(config.kafka.publish_timeout_ms))
            .build()?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue = Arc::new(QueueController::new(
        queue_store,
        PassSigner::new(config.booking.queue_pass_secret.as_bytes()),
        Arc::clone(&clock),
        QueueControllerConfig {
            entry_ttl_seconds: config.booking.queue_entry_ttl_seconds,
            pass_ttl_seconds: config.booking.queue_pass_ttl_seconds,
            max_queue_size: config.booking.max_queue_size,
            ..QueueControllerConfig::default()
        },
    ));

    let catalog: Arc<dyn Catalog> =
        Arc::new(StaticCatalog::new(config.booking.queue_pass_required));

    let reservations = Arc::new(ReservationService::new(
        Arc::clone(&bookings),
        Arc::clone(&inventory),
        Arc::clone(&queue),
        Arc::clone(&catalog),
        Arc::clone(&clock),
        ReservationConfig {
            reservation_ttl_seconds: config.booking.reservation_ttl_seconds,
            default_max_per_user: config.booking.default_max_per_user,
            currency: config.booking.currency.clone(),
            ..ReservationConfig::default()
        },
    ));

    // Background machinery.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    let definition = SagaDefinition::booking();
    let confirm_retries = definition
        .step(stampede_saga::steps::CONFIRM_BOOKING)
        .map_or(3, |step| step.max_retries);
    let notify_retries = definition
        .step(stampede_saga::steps::SEND_NOTIFICATION)
        .map_or(5, |step| step.max_retries);

    let orchestrator = Arc::new(SagaOrchestrator::new(
        definition,
        Arc::clone(&saga_store),
        Arc::clone(&bus),
        Arc::clone(&clock),
    ));
    background.push(orchestrator.spawn(shutdown_rx.clone()));

    let worker_ctx = |max_retries: u32, source: &'static str| StepWorkerContext {
        bus: Arc::clone(&bus),
        saga_store: Arc::clone(&saga_store),
        backoff: RetryPolicy::default(),
        max_retries,
        source,
    };

    background.push(spawn_worker(
        Arc::new(ConfirmBookingWorker::new(
            Arc::clone(&bookings),
            Arc::clone(&inventory),
            Arc::clone(&queue),
            worker_ctx(confirm_retries, "confirm-booking-worker"),
        )),
        Arc::clone(&bus),
        shutdown_rx.clone(),
    ));

    background.push(spawn_worker(
        Arc::new(NotificationWorker::new(
            Arc::new(LogNotifier),
            worker_ctx(notify_retries, "notification-worker"),
        )),
        Arc::clone(&bus),
        shutdown_rx.clone(),
    ));

    background.push(spawn_worker(
        Arc::new(CompensationWorker::new(
            Arc::clone(&inventory),
            Arc::clone(&bus),
            worker_ctx(3, "compensation-worker"),
        )),
        Arc::clone(&bus),
        shutdown_rx.clone(),
    ));

    let sweeper = ExpirationSweeper::new(
        Arc::clone(&bookings),
        Arc::clone(&inventory),
        Duration::from_secs(config.booking.sweep_interval_seconds),
        config.booking.sweep_batch_limit,
    );
    background.push(sweeper.spawn(shutdown_rx.clone()));

    // The relay delivers the lifecycle events the ledger stages.
    let relay = OutboxRelay::new(
        outbox_store,
        Arc::clone(&bus),
        Duration::from_millis(config.booking.outbox_interval_ms),
        config.booking.outbox_batch_limit,
    );
    background.push(relay.spawn(shutdown_rx.clone()));

    if !config.booking.admission_events.is_empty() {
        let admission = AdmissionLoop::new(
            Arc::clone(&queue),
            config
                .booking
                .admission_events
                .iter()
                .map(EventId::new)
                .collect(),
            Duration::from_secs(config.booking.admission_interval_seconds),
            config.booking.admission_batch,
        );
        background.push(admission.spawn(shutdown_rx.clone()));
    }

    // HTTP surface.
    let app = routes::build_router(state::AppState {
        queue,
        reservations,
        bookings,
        inventory,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down background tasks");
    let _ = shutdown_tx.send(true);
    for task in background {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sigterm) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
