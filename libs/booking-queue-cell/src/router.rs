use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::{
    get_queue_stats, list_dead_letters, requeue_dead_letter, submit_booking, BookingQueueState,
};

pub fn create_booking_queue_router(state: BookingQueueState) -> Router {
    let protected_routes = Router::new()
        .route("/bookings", post(submit_booking))
        .route("/stats", get(get_queue_stats))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{message_id}/requeue", post(requeue_dead_letter))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
