use assert_matches::assert_matches;
use tokio::time::Duration;
use uuid::Uuid;

use booking_queue_cell::*;
use super::{monday_at, TestPipeline};

#[tokio::test]
async fn test_submit_returns_acknowledgement_not_booking() {
    let pipeline = TestPipeline::new().await;
    let patient_id = Uuid::new_v4();

    let ack = pipeline
        .producer
        .submit(pipeline.request(patient_id, monday_at(9, 0), monday_at(10, 0)))
        .await
        .expect("valid request should be accepted");

    assert!(!ack.duplicate);
    assert_eq!(ack.group_key, format!("schedule-{}", pipeline.schedule.id));
    assert_eq!(
        ack.dedup_key,
        format!("{}-{}-2025-01-06T09:00:00Z", pipeline.schedule.id, patient_id)
    );

    // Nothing is booked until the consumer runs.
    assert!(pipeline.store.bookings_for(pipeline.schedule.id).await.is_empty());
    assert_eq!(pipeline.queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_enqueued_message_carries_the_request() {
    let pipeline = TestPipeline::new().await;
    let request = pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0));

    let ack = pipeline.producer.submit(request.clone()).await.unwrap();
    let delivery = pipeline.queue.receive(Duration::ZERO).await.unwrap().unwrap();

    assert_eq!(delivery.message_id, ack.message_id);
    assert_eq!(delivery.group_key, ack.group_key);
    assert_eq!(delivery.receive_count, 1);

    let message: QueueMessage = serde_json::from_str(&delivery.payload).unwrap();
    assert_eq!(message.body, request);
    assert_eq!(message.dedup_key, ack.dedup_key);
}

#[tokio::test]
async fn test_resubmission_collapses_within_dedup_window() {
    let pipeline = TestPipeline::new().await;
    let request = pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0));

    let first = pipeline.producer.submit(request.clone()).await.unwrap();
    let second = pipeline.producer.submit(request).await.unwrap();

    assert!(second.duplicate);
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(pipeline.queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_different_patients_same_slot_are_both_enqueued() {
    let pipeline = TestPipeline::new().await;

    let a = pipeline
        .producer
        .submit(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await
        .unwrap();
    let b = pipeline
        .producer
        .submit(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await
        .unwrap();

    assert_ne!(a.message_id, b.message_id);
    assert_eq!(a.group_key, b.group_key);
    assert_eq!(pipeline.queue.stats().await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_malformed_requests_are_refused_before_enqueue() {
    let pipeline = TestPipeline::new().await;

    let inverted = pipeline.request(Uuid::new_v4(), monday_at(10, 0), monday_at(9, 0));
    assert_matches!(pipeline.producer.submit(inverted).await, Err(BookingQueueError::Validation(_)));

    let empty = pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(9, 0));
    assert_matches!(pipeline.producer.submit(empty).await, Err(BookingQueueError::Validation(_)));

    let no_patient = pipeline.request(Uuid::nil(), monday_at(9, 0), monday_at(10, 0));
    assert_matches!(pipeline.producer.submit(no_patient).await, Err(BookingQueueError::Validation(_)));

    let mut cancelled = pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0));
    cancelled.status = Some(BookingStatus::Cancelled);
    assert_matches!(pipeline.producer.submit(cancelled).await, Err(BookingQueueError::Validation(_)));

    assert_eq!(pipeline.queue.stats().await.unwrap(), QueueStats::default());
}

#[test]
fn test_validation_maps_to_bad_request() {
    let err: shared_models::error::AppError = BookingQueueError::Validation("bad".to_string()).into();
    assert_matches!(err, shared_models::error::AppError::BadRequest(_));

    let err: shared_models::error::AppError = BookingQueueError::QueueUnavailable("down".to_string()).into();
    assert_matches!(err, shared_models::error::AppError::ServiceUnavailable(_));
}
