use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use booking_queue_cell::{
    BookingConsumerService, BookingEventKind, BookingEventPublisher, BookingEventReceiver,
    BookingQueueState, BookingStore, InMemoryBookingStore, InMemoryQueue, QueueTransport,
    RedisQueueService, SupabaseBookingStore, WorkerConfig,
};
use shared_config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking API server");

    let config = Arc::new(AppConfig::from_env());

    let store: Arc<dyn BookingStore> = if config.is_booking_store_configured() {
        Arc::new(SupabaseBookingStore::new(&config))
    } else {
        warn!("Supabase service credentials missing, bookings are kept in memory");
        Arc::new(InMemoryBookingStore::new())
    };

    let queue: Arc<dyn QueueTransport> = match config.redis_url {
        Some(_) => Arc::new(
            RedisQueueService::from_config(&config)
                .await
                .context("failed to connect to the Redis booking queue")?,
        ),
        None => {
            warn!("REDIS_URL not set, using the in-process booking queue");
            Arc::new(InMemoryQueue::new(Duration::from_secs(
                config.booking_queue.dedup_window_secs,
            )))
        }
    };

    let events = BookingEventPublisher::default();
    tokio::spawn(relay_notifications(events.subscribe()));

    let consumer = Arc::new(BookingConsumerService::new(
        WorkerConfig::from_settings(&config.booking_queue),
        Arc::clone(&queue),
        store,
        events,
    ));
    let consumer_task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                error!("Booking consumer failed: {}", e);
            }
        })
    };

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = BookingQueueState::new(Arc::clone(&config), queue);

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    consumer.shutdown().await?;
    if let Err(e) = consumer_task.await {
        error!("Booking consumer task ended abnormally: {}", e);
    }

    info!("Booking API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

/// Hands booking outcomes to the notification side. Delivery channels
/// (email, push) subscribe here; this relay only records them.
async fn relay_notifications(mut events: BookingEventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => match event.kind {
                BookingEventKind::Accepted => info!(
                    message_id = %event.message_id,
                    "Notify patient {:?}: booking {:?} accepted",
                    event.patient_id, event.booking_id
                ),
                BookingEventKind::Rejected => info!(
                    message_id = %event.message_id,
                    "Notify patient {:?}: booking rejected ({})",
                    event.patient_id,
                    event.reason.as_deref().unwrap_or("unknown")
                ),
                BookingEventKind::DeadLettered => warn!(
                    message_id = %event.message_id,
                    "Booking request dead-lettered: {}",
                    event.reason.as_deref().unwrap_or("unknown")
                ),
            },
            Err(RecvError::Lagged(skipped)) => warn!("Notification relay lagged, {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
