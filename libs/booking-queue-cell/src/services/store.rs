use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::services::conflict::overlaps;
use crate::{Booking, BookingQueueError, BookingStatus, NewBooking, Schedule, StoreError};

/// Source of truth for schedules and accepted bookings.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>, StoreError>;

    /// Pending/Confirmed bookings of the schedule overlapping `[start, end)`.
    async fn find_overlapping(
        &self,
        schedule_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Must fail with [`StoreError::UniqueViolation`] when an active booking
    /// already starts at the same instant on the same schedule.
    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError>;
}

#[derive(Default)]
pub struct InMemoryBookingStore {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    bookings: RwLock<Vec<Booking>>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_schedule(&self, schedule: Schedule) {
        self.schedules.write().await.insert(schedule.id, schedule);
    }

    pub async fn remove_schedule(&self, schedule_id: Uuid) -> Option<Schedule> {
        self.schedules.write().await.remove(&schedule_id)
    }

    pub async fn bookings_for(&self, schedule_id: Uuid) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .read()
            .await
            .iter()
            .filter(|b| b.schedule_id == schedule_id)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.start_time);
        bookings
    }

    /// Stands in for the review workflow in tests and local runs.
    pub async fn set_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, BookingQueueError> {
        let mut bookings = self.bookings.write().await;
        let booking = bookings
            .iter_mut()
            .find(|b| b.id == booking_id)
            .ok_or(BookingQueueError::BookingNotFound(booking_id))?;
        booking.status = booking.status.transition(status)?;
        Ok(booking.clone())
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn find_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.read().await.get(&schedule_id).cloned())
    }

    async fn find_overlapping(
        &self,
        schedule_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, StoreError> {
        let bookings = self.bookings.read().await;
        let mut found: Vec<Booking> = bookings
            .iter()
            .filter(|b| b.schedule_id == schedule_id && b.status.is_active())
            .filter(|b| overlaps(b.start_time, b.end_time, start, end))
            .cloned()
            .collect();
        found.sort_by_key(|b| b.start_time);
        Ok(found)
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut bookings = self.bookings.write().await;

        let duplicate = bookings.iter().any(|b| {
            b.schedule_id == booking.schedule_id
                && b.start_time == booking.start_time
                && b.status.is_active()
        });
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "booking for schedule {} at {} already exists",
                booking.schedule_id, booking.start_time
            )));
        }

        let stored = Booking {
            id: Uuid::new_v4(),
            schedule_id: booking.schedule_id,
            patient_id: booking.patient_id,
            start_time: booking.start_time,
            end_time: booking.end_time,
            status: booking.status,
            created_at: Utc::now(),
        };
        bookings.push(stored.clone());

        debug!("Stored booking {} for schedule {}", stored.id, stored.schedule_id);
        Ok(stored)
    }
}
