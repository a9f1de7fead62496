use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::{DatabaseError, SupabaseClient};

use crate::services::store::BookingStore;
use crate::{Booking, BookingStatus, NewBooking, Schedule, StoreError};

/// Booking store backed by the `schedules` and `bookings` tables over PostgREST.
///
/// Runs with the service role key: callers were authorized before their
/// request reached the queue.
pub struct SupabaseBookingStore {
    supabase: Arc<SupabaseClient>,
    service_token: String,
}

impl SupabaseBookingStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            service_token: config.supabase_service_role_key.clone(),
        }
    }

    pub fn with_client(supabase: Arc<SupabaseClient>, service_token: String) -> Self {
        Self { supabase, service_token }
    }

    fn timestamp(value: DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn active_status_filter() -> String {
        format!(
            "in.({},{})",
            BookingStatus::Pending.as_str(),
            BookingStatus::Confirmed.as_str()
        )
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        if err.is_unique_violation() {
            StoreError::UniqueViolation(err.to_string())
        } else if err.is_transient() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Rejected(err.to_string())
        }
    }
}

#[async_trait]
impl BookingStore for SupabaseBookingStore {
    async fn find_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let path = format!("/rest/v1/schedules?id=eq.{}&limit=1", schedule_id);

        let mut rows: Vec<Schedule> = self
            .supabase
            .request(Method::GET, &path, Some(&self.service_token), None)
            .await?;

        Ok(rows.pop())
    }

    async fn find_overlapping(
        &self,
        schedule_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, StoreError> {
        // existing.start < candidate.end AND existing.end > candidate.start
        let query_parts = [
            format!("schedule_id=eq.{}", schedule_id),
            format!("status={}", Self::active_status_filter()),
            format!("start_time=lt.{}", Self::timestamp(end)),
            format!("end_time=gt.{}", Self::timestamp(start)),
        ];

        let path = format!("/rest/v1/bookings?{}&order=start_time.asc", query_parts.join("&"));
        debug!("Querying overlapping bookings: {}", path);

        let bookings: Vec<Booking> = self
            .supabase
            .request(Method::GET, &path, Some(&self.service_token), None)
            .await?;

        Ok(bookings)
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let body = json!({
            "schedule_id": booking.schedule_id,
            "patient_id": booking.patient_id,
            "start_time": Self::timestamp(booking.start_time),
            "end_time": Self::timestamp(booking.end_time),
            "status": booking.status,
        });

        let mut rows: Vec<Booking> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/bookings",
                Some(&self.service_token),
                Some(body),
                &[("prefer", "return=representation")],
            )
            .await?;

        rows.pop().ok_or_else(|| {
            warn!("Insert for schedule {} returned no representation", booking.schedule_id);
            StoreError::Rejected("insert returned no rows".to_string())
        })
    }
}
