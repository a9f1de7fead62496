use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum BookingQueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    #[error("Booking not found: {0}")]
    BookingNotFound(Uuid),

    #[error("Invalid booking status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },
}

impl BookingQueueError {
    /// Infrastructure hiccups the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BookingQueueError::QueueUnavailable(_) | BookingQueueError::Redis(_))
    }
}

impl From<BookingQueueError> for AppError {
    fn from(err: BookingQueueError) -> Self {
        match err {
            BookingQueueError::Validation(msg) => AppError::BadRequest(msg),
            BookingQueueError::MessageNotFound(id) => AppError::NotFound(format!("Message {} not found", id)),
            BookingQueueError::BookingNotFound(id) => AppError::NotFound(format!("Booking {} not found", id)),
            e if e.is_transient() => AppError::ServiceUnavailable("Booking queue is unavailable, retry later".to_string()),
            e => AppError::Internal(e.to_string()),
        }
    }
}

/// Failure to store or look up bookings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store rejected operation: {0}")]
    Rejected(String),
}

/// Why a single delivery could not be processed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown schedule {0}")]
    UnknownSchedule(Uuid),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => IngestError::Transient(msg),
            StoreError::UniqueViolation(msg) | StoreError::Rejected(msg) => IngestError::Storage(msg),
        }
    }
}
