use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{auth::User, error::AppError};
use shared_utils::extractor::require_role;

use crate::services::{producer::BookingProducerService, queue::QueueTransport};
use crate::{BookingRequest, BookingStatus};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Clone)]
pub struct BookingQueueState {
    pub config: Arc<AppConfig>,
    pub producer: Arc<BookingProducerService>,
    pub queue: Arc<dyn QueueTransport>,
}

impl BookingQueueState {
    pub fn new(config: Arc<AppConfig>, queue: Arc<dyn QueueTransport>) -> Self {
        Self {
            producer: Arc::new(BookingProducerService::new(Arc::clone(&queue))),
            config,
            queue,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// Accept a booking request for asynchronous processing
pub async fn submit_booking(
    State(state): State<BookingQueueState>,
    Extension(user): Extension<User>,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    info!("Booking request from user: {}", user.id);

    let is_admin = user.has_role("admin");

    if !is_admin && request.patient_id.to_string() != user.id {
        return Err(AppError::Forbidden(
            "Patients can only book appointments for themselves".to_string(),
        ));
    }

    // Confirmation belongs to the provider review step.
    if !is_admin && matches!(request.status, Some(status) if status != BookingStatus::Pending) {
        return Err(AppError::Forbidden(
            "Only administrators can set the initial booking status".to_string(),
        ));
    }

    let ack = state.producer.submit(request).await.map_err(|e| {
        warn!("Booking submission refused: {}", e);
        AppError::from(e)
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message_id": ack.message_id,
            "dedup_key": ack.dedup_key,
            "group_key": ack.group_key,
            "duplicate": ack.duplicate,
            "accepted_at": ack.accepted_at,
            "message": "Booking request queued; the outcome will be notified"
        })),
    ))
}

/// Queue depth counters
pub async fn get_queue_stats(
    State(state): State<BookingQueueState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    info!("Queue stats request from user: {}", user.id);

    let stats = state.queue.stats().await.map_err(|e| {
        error!("Failed to read queue stats: {}", e);
        AppError::from(e)
    })?;

    Ok(Json(json!({
        "pending": stats.pending,
        "in_flight": stats.in_flight,
        "dead_lettered": stats.dead_lettered
    })))
}

/// Most recent dead letters (admin only)
pub async fn list_dead_letters(
    State(state): State<BookingQueueState>,
    Extension(user): Extension<User>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, "admin")?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    let letters = state.queue.dead_letters(limit).await.map_err(|e| {
        error!("Failed to list dead letters: {}", e);
        AppError::from(e)
    })?;

    Ok(Json(json!({
        "dead_letters": letters,
        "total": letters.len()
    })))
}

/// Put a dead letter back on the queue (admin only)
pub async fn requeue_dead_letter(
    State(state): State<BookingQueueState>,
    Extension(user): Extension<User>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, "admin")?;
    info!("Requeue of dead letter {} requested by {}", message_id, user.id);

    let requeued = state.queue.requeue_dead_letter(message_id).await.map_err(|e| {
        error!("Failed to requeue dead letter {}: {}", message_id, e);
        AppError::from(e)
    })?;

    if !requeued {
        return Err(AppError::NotFound(format!("Dead letter {} not found", message_id)));
    }

    Ok(Json(json!({
        "success": true,
        "message_id": message_id,
        "message": "Dead letter requeued"
    })))
}
