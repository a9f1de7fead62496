use axum::{routing::get, Router};

use booking_queue_cell::{create_booking_queue_router, BookingQueueState};

pub fn create_router(state: BookingQueueState) -> Router {
    Router::new()
        .route("/", get(|| async { "Booking API is running!" }))
        .nest("/booking-queue", create_booking_queue_router(state))
}
