use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::services::conflict::{self, ConflictVerdict};
use crate::services::notification::BookingEventPublisher;
use crate::services::queue::QueueTransport;
use crate::services::store::BookingStore;
use crate::{
    group_key, BookingEvent, BookingRequest, Delivery, IngestError, IngestOutcome, QueueMessage,
    StoreError, WorkerConfig,
};

/// Conflict-checked insert of one delivery at a time.
///
/// Callers must not run two deliveries of the same lane concurrently; the
/// lane dispatcher and [`process_batch`](Self::process_batch) guarantee that.
pub struct BookingIngestionWorker {
    config: WorkerConfig,
    queue: Arc<dyn QueueTransport>,
    store: Arc<dyn BookingStore>,
    events: BookingEventPublisher,
}

impl BookingIngestionWorker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn QueueTransport>,
        store: Arc<dyn BookingStore>,
        events: BookingEventPublisher,
    ) -> Self {
        Self { config, queue, store, events }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Processes a delivery to a terminal outcome and settles it with the
    /// transport (ack or dead-letter). Never returns an error: one bad
    /// message must not stall its lane.
    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id, group_key = %delivery.group_key))]
    pub async fn process_delivery(&self, delivery: Delivery) -> IngestOutcome {
        if delivery.receive_count > self.config.max_receive_count {
            let reason = format!(
                "delivered {} times, exceeding the limit of {}",
                delivery.receive_count, self.config.max_receive_count
            );
            return self.dead_letter(&delivery, None, reason).await;
        }

        let message = match parse_delivery(&delivery) {
            Ok(message) => message,
            Err(e) => return self.dead_letter(&delivery, None, e.to_string()).await,
        };

        let mut attempt = 1;
        let outcome = loop {
            match self.ingest(&message).await {
                Ok(outcome) => break outcome,
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "Attempt {}/{} failed for message {}: {}; retrying in {:?}",
                        attempt, self.config.max_attempts, delivery.message_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let reason = if e.is_transient() {
                        format!("retry budget exhausted after {} attempts: {}", attempt, e)
                    } else {
                        e.to_string()
                    };
                    return self.dead_letter(&delivery, Some(&message.body), reason).await;
                }
            }
        };

        self.publish_outcome(&message, &outcome);

        if let Err(e) = self.queue.ack(delivery.message_id).await {
            // Left in flight; a redelivery resolves to Duplicate.
            error!("Failed to acknowledge message {}: {}", delivery.message_id, e);
        }

        outcome
    }

    /// Conflict check and insert for one parsed message, without retries.
    pub async fn ingest(&self, message: &QueueMessage) -> Result<IngestOutcome, IngestError> {
        let candidate = message.body.to_new_booking();

        let schedule = self
            .store
            .find_schedule(candidate.schedule_id)
            .await?
            .ok_or(IngestError::UnknownSchedule(candidate.schedule_id))?;

        if !schedule.covers(candidate.start_time, candidate.end_time) {
            info!(
                schedule_id = %candidate.schedule_id,
                "Request {} falls outside the schedule window, dropping", message.message_id
            );
            return Ok(IngestOutcome::OutsideSchedule);
        }

        let existing = self
            .store
            .find_overlapping(candidate.schedule_id, candidate.start_time, candidate.end_time)
            .await?;

        match conflict::evaluate(&candidate, &existing) {
            ConflictVerdict::Free => {}
            ConflictVerdict::AlreadyClaimed(booking_id) => {
                info!("Message {} was already booked as {}", message.message_id, booking_id);
                return Ok(IngestOutcome::Duplicate { existing: Some(booking_id) });
            }
            ConflictVerdict::Taken(conflicting) => {
                warn!(
                    schedule_id = %candidate.schedule_id,
                    "Slot {} - {} already taken by {:?}, dropping message {}",
                    candidate.start_time, candidate.end_time, conflicting, message.message_id
                );
                return Ok(IngestOutcome::Conflict { conflicting });
            }
        }

        match self.store.insert_booking(candidate).await {
            Ok(booking) => {
                info!(
                    schedule_id = %booking.schedule_id,
                    "Booking {} created for patient {} ({})",
                    booking.id, booking.patient_id, booking.status
                );
                Ok(IngestOutcome::Accepted(booking))
            }
            Err(StoreError::UniqueViolation(detail)) => {
                warn!("Insert for message {} raced a concurrent insert: {}", message.message_id, detail);
                Ok(IngestOutcome::Duplicate { existing: None })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Serverless-style entry point: deliveries are grouped by lane, lanes run
    /// concurrently and each lane runs in arrival order. Results come back in
    /// input order.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> Vec<(Uuid, IngestOutcome)> {
        let total = deliveries.len();
        let lanes = partition_lanes(deliveries.into_iter().enumerate().collect(), |(_, d)| &d.group_key);
        debug!("Processing batch across {} lanes", lanes.len());

        let settled = join_all(lanes.into_iter().map(|(_, lane)| async move {
            let mut outcomes = Vec::with_capacity(lane.len());
            for (index, delivery) in lane {
                let message_id = delivery.message_id;
                outcomes.push((index, message_id, self.process_delivery(delivery).await));
            }
            outcomes
        }))
        .await;

        let mut results: Vec<Option<(Uuid, IngestOutcome)>> = (0..total).map(|_| None).collect();
        for (index, message_id, outcome) in settled.into_iter().flatten() {
            results[index] = Some((message_id, outcome));
        }
        results.into_iter().flatten().collect()
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        request: Option<&BookingRequest>,
        reason: String,
    ) -> IngestOutcome {
        error!(
            receive_count = delivery.receive_count,
            "Dead-lettering message {}: {}", delivery.message_id, reason
        );

        if let Err(e) = self.queue.dead_letter(delivery, &reason).await {
            error!("Failed to dead-letter message {}: {}", delivery.message_id, e);
        }

        self.events
            .publish(BookingEvent::dead_lettered(delivery.message_id, request, &reason));

        IngestOutcome::DeadLettered { reason }
    }

    fn publish_outcome(&self, message: &QueueMessage, outcome: &IngestOutcome) {
        let event = match outcome {
            IngestOutcome::Accepted(booking) => BookingEvent::accepted(message.message_id, booking),
            IngestOutcome::Conflict { .. } => {
                BookingEvent::rejected(message.message_id, &message.body, "slot already booked")
            }
            IngestOutcome::Duplicate { existing: None } => {
                BookingEvent::rejected(message.message_id, &message.body, "slot already booked")
            }
            IngestOutcome::OutsideSchedule => {
                BookingEvent::rejected(message.message_id, &message.body, "outside schedule availability")
            }
            // Redelivery of an accepted request; the patient was already told.
            IngestOutcome::Duplicate { existing: Some(_) } | IngestOutcome::DeadLettered { .. } => return,
        };
        self.events.publish(event);
    }
}

fn parse_delivery(delivery: &Delivery) -> Result<QueueMessage, IngestError> {
    let message: QueueMessage = serde_json::from_str(&delivery.payload)
        .map_err(|e| IngestError::Malformed(format!("unparseable payload: {}", e)))?;

    message
        .body
        .validate()
        .map_err(|e| IngestError::Malformed(e.to_string()))?;

    let expected_lane = group_key(message.body.schedule_id);
    if message.group_key != expected_lane || delivery.group_key != expected_lane {
        return Err(IngestError::Malformed(format!(
            "lane {} does not match schedule lane {}",
            delivery.group_key, expected_lane
        )));
    }

    Ok(message)
}

/// Splits deliveries into lanes, keeping arrival order within each lane and
/// first-seen order across lanes.
pub fn group_by_lane(deliveries: Vec<Delivery>) -> Vec<(String, Vec<Delivery>)> {
    partition_lanes(deliveries, |d| &d.group_key)
}

fn partition_lanes<T>(items: Vec<T>, lane_of: impl Fn(&T) -> &String) -> Vec<(String, Vec<T>)> {
    let mut lanes: Vec<(String, Vec<T>)> = Vec::new();
    for item in items {
        match lanes.iter_mut().find(|(key, _)| key == lane_of(&item)) {
            Some((_, lane)) => lane.push(item),
            None => lanes.push((lane_of(&item).clone(), vec![item])),
        }
    }
    lanes
}
