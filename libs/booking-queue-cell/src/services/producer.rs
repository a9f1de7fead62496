use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::services::queue::QueueTransport;
use crate::{BookingAcknowledgement, BookingQueueError, BookingRequest, QueueMessage};

/// API-facing side of the pipeline: validate shape, enqueue, acknowledge.
///
/// Slot availability is never checked here; that happens once, on the
/// schedule's lane, in the ingestion worker.
pub struct BookingProducerService {
    queue: Arc<dyn QueueTransport>,
}

impl BookingProducerService {
    pub fn new(queue: Arc<dyn QueueTransport>) -> Self {
        Self { queue }
    }

    pub async fn submit(&self, request: BookingRequest) -> Result<BookingAcknowledgement, BookingQueueError> {
        request.validate()?;

        let message = QueueMessage::new(request);

        let receipt = self.queue.enqueue(&message).await.map_err(|e| {
            warn!(
                schedule_id = %message.body.schedule_id,
                "Booking queue rejected enqueue: {}", e
            );
            match e {
                BookingQueueError::Serialization(_) => e,
                other => BookingQueueError::QueueUnavailable(other.to_string()),
            }
        })?;

        if receipt.duplicate {
            info!(
                dedup_key = %message.dedup_key,
                "Duplicate booking submission collapsed onto message {}", receipt.message_id
            );
        } else {
            info!(
                group_key = %message.group_key,
                "Booking request for patient {} queued as message {}",
                message.body.patient_id, receipt.message_id
            );
        }

        Ok(BookingAcknowledgement {
            message_id: receipt.message_id,
            dedup_key: message.dedup_key,
            group_key: message.group_key,
            duplicate: receipt.duplicate,
            accepted_at: Utc::now(),
        })
    }
}
