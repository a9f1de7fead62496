use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_config::BookingQueueSettings;

use crate::BookingQueueError;

// ==============================================================================
// SCHEDULES AND BOOKINGS
// ==============================================================================

/// A provider's recurring weekly availability window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub day_of_week: i32, // 0 = Sunday, 1 = Monday, etc.
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl Schedule {
    pub fn new(
        id: Uuid,
        provider_id: Uuid,
        day_of_week: i32,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Self, BookingQueueError> {
        if !(0..=6).contains(&day_of_week) {
            return Err(BookingQueueError::Validation(
                "Day of week must be between 0 (Sunday) and 6 (Saturday)".to_string(),
            ));
        }
        if end_time <= start_time {
            return Err(BookingQueueError::Validation(
                "Schedule end time must be after start time".to_string(),
            ));
        }

        Ok(Self { id, provider_id, day_of_week, start_time, end_time })
    }

    /// Whether `[start, end)` sits inside one occurrence of this window.
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < end
            && start.date_naive() == end.date_naive()
            && start.weekday().num_days_from_sunday() as i32 == self.day_of_week
            && self.start_time <= start.time()
            && end.time() <= self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings hold their slot; cancelled ones release it.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(&self, target: &BookingStatus) -> bool {
        use BookingStatus::*;
        match (self, target) {
            (Pending, Confirmed) => true,
            (Pending, Cancelled) => true,
            (Pending, Pending) | (Confirmed, _) | (Cancelled, _) => false,
        }
    }

    pub fn transition(self, target: BookingStatus) -> Result<BookingStatus, BookingQueueError> {
        if self.can_transition_to(&target) {
            Ok(target)
        } else {
            Err(BookingQueueError::InvalidStatusTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = BookingQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(BookingQueueError::Validation(format!("Unknown booking status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// Same patient, same interval: a redelivery of a request that already won its slot.
    pub fn is_same_claim(&self, candidate: &NewBooking) -> bool {
        self.schedule_id == candidate.schedule_id
            && self.patient_id == candidate.patient_id
            && self.start_time == candidate.start_time
            && self.end_time == candidate.end_time
    }
}

/// A candidate booking about to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBooking {
    pub schedule_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
}

// ==============================================================================
// QUEUE CONTRACT
// ==============================================================================

/// The booking request as submitted by an already-authorized caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub schedule_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BookingStatus>,
}

impl BookingRequest {
    /// Structural checks only. Slot availability is decided by the consumer.
    pub fn validate(&self) -> Result<(), BookingQueueError> {
        if self.schedule_id.is_nil() {
            return Err(BookingQueueError::Validation("schedule_id is required".to_string()));
        }
        if self.patient_id.is_nil() {
            return Err(BookingQueueError::Validation("patient_id is required".to_string()));
        }
        if self.end_time <= self.start_time {
            return Err(BookingQueueError::Validation(
                "end_time must be after start_time".to_string(),
            ));
        }
        if self.status == Some(BookingStatus::Cancelled) {
            return Err(BookingQueueError::Validation(
                "A booking cannot be requested in cancelled state".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dedup_key(&self) -> String {
        dedup_key(self.schedule_id, self.patient_id, self.start_time)
    }

    pub fn group_key(&self) -> String {
        group_key(self.schedule_id)
    }

    pub fn to_new_booking(&self) -> NewBooking {
        NewBooking {
            schedule_id: self.schedule_id,
            patient_id: self.patient_id,
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status.unwrap_or(BookingStatus::Pending),
        }
    }
}

/// Deduplication key: `{schedule_id}-{patient_id}-{start_time}`.
pub fn dedup_key(schedule_id: Uuid, patient_id: Uuid, start_time: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        schedule_id,
        patient_id,
        start_time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
}

/// Lane key: every request for one schedule shares a lane.
pub fn group_key(schedule_id: Uuid) -> String {
    format!("schedule-{}", schedule_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub dedup_key: String,
    pub group_key: String,
    pub enqueued_at: DateTime<Utc>,
    pub body: BookingRequest,
}

impl QueueMessage {
    pub fn new(body: BookingRequest) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            dedup_key: body.dedup_key(),
            group_key: body.group_key(),
            enqueued_at: Utc::now(),
            body,
        }
    }
}

/// A message as handed to the consumer by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: Uuid,
    pub group_key: String,
    pub payload: String,
    pub receive_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub message_id: Uuid,
    pub duplicate: bool,
}

/// Acceptance receipt returned to the caller. Not a booking confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingAcknowledgement {
    pub message_id: Uuid,
    pub dedup_key: String,
    pub group_key: String,
    pub duplicate: bool,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub group_key: String,
    pub payload: String,
    pub reason: String,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

// ==============================================================================
// PROCESSING OUTCOMES AND EVENTS
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(Booking),
    /// Lost the race for the slot. Dropped, never retried.
    Conflict { conflicting: Vec<Uuid> },
    /// Already booked by this very request, or caught by the uniqueness backstop.
    Duplicate { existing: Option<Uuid> },
    OutsideSchedule,
    DeadLettered { reason: String },
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted(_) => "accepted",
            IngestOutcome::Conflict { .. } => "conflict",
            IngestOutcome::Duplicate { .. } => "duplicate",
            IngestOutcome::OutsideSchedule => "outside_schedule",
            IngestOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingEventKind {
    Accepted,
    Rejected,
    DeadLettered,
}

/// Plain record handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub kind: BookingEventKind,
    pub message_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub schedule_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl BookingEvent {
    pub fn accepted(message_id: Uuid, booking: &Booking) -> Self {
        Self {
            kind: BookingEventKind::Accepted,
            message_id,
            booking_id: Some(booking.id),
            schedule_id: Some(booking.schedule_id),
            patient_id: Some(booking.patient_id),
            start_time: Some(booking.start_time),
            end_time: Some(booking.end_time),
            reason: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn rejected(message_id: Uuid, request: &BookingRequest, reason: &str) -> Self {
        Self {
            kind: BookingEventKind::Rejected,
            message_id,
            booking_id: None,
            schedule_id: Some(request.schedule_id),
            patient_id: Some(request.patient_id),
            start_time: Some(request.start_time),
            end_time: Some(request.end_time),
            reason: Some(reason.to_string()),
            occurred_at: Utc::now(),
        }
    }

    /// The payload may be unparseable, so only the envelope id is guaranteed.
    pub fn dead_lettered(message_id: Uuid, request: Option<&BookingRequest>, reason: &str) -> Self {
        Self {
            kind: BookingEventKind::DeadLettered,
            message_id,
            booking_id: None,
            schedule_id: request.map(|r| r.schedule_id),
            patient_id: request.map(|r| r.patient_id),
            start_time: request.map(|r| r.start_time),
            end_time: request.map(|r| r.end_time),
            reason: Some(reason.to_string()),
            occurred_at: Utc::now(),
        }
    }
}

// ==============================================================================
// WORKER CONFIGURATION
// ==============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_receive_count: u32,
    pub receive_wait_ms: u64,
    pub max_concurrent_lanes: usize,
    pub max_in_flight: usize,
    pub lane_idle_secs: u64,
    pub consumer_lease_secs: u64,
    pub graceful_shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&BookingQueueSettings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &BookingQueueSettings) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            max_attempts: settings.max_attempts.max(1),
            retry_delay_ms: settings.retry_delay_ms,
            max_receive_count: settings.max_receive_count.max(1),
            receive_wait_ms: settings.receive_wait_ms,
            max_concurrent_lanes: settings.max_concurrent_lanes.max(1),
            max_in_flight: settings.max_in_flight.max(1),
            lane_idle_secs: settings.lane_idle_secs,
            consumer_lease_secs: settings.consumer_lease_secs.max(1),
            graceful_shutdown_timeout_seconds: settings.shutdown_timeout_secs,
        }
    }

    /// Backoff before retry number `attempt` (1-based): doubles each time.
    pub fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        std::time::Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}
