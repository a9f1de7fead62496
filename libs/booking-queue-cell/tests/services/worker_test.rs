use std::sync::atomic::Ordering;
use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::Duration as ChronoDuration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Duration;
use uuid::Uuid;

use booking_queue_cell::*;
use super::{assert_no_overlaps, monday_at, test_schedule, BlindStore, FlakyStore, TestPipeline};

#[tokio::test]
async fn test_first_come_first_served_on_one_schedule() {
    let pipeline = TestPipeline::new().await;
    let mut events = pipeline.events.subscribe();

    let a = pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0));
    let b = pipeline.request(Uuid::new_v4(), monday_at(9, 30), monday_at(10, 30));
    let c = pipeline.request(Uuid::new_v4(), monday_at(10, 0), monday_at(11, 0));
    for request in [a.clone(), b, c.clone()] {
        pipeline.producer.submit(request).await.unwrap();
    }

    let deliveries = pipeline.drain_deliveries().await;
    let outcomes = pipeline.worker.process_batch(deliveries).await;

    assert_eq!(outcomes.len(), 3);
    assert_matches!(&outcomes[0].1, IngestOutcome::Accepted(booking) if booking.patient_id == a.patient_id);
    assert_matches!(&outcomes[1].1, IngestOutcome::Conflict { conflicting } if conflicting.len() == 1);
    assert_matches!(&outcomes[2].1, IngestOutcome::Accepted(booking) if booking.patient_id == c.patient_id);

    let bookings = pipeline.store.bookings_for(pipeline.schedule.id).await;
    assert_eq!(bookings.len(), 2);
    assert!(bookings.iter().all(|b| b.status == BookingStatus::Pending));
    assert_no_overlaps(&bookings);

    let kinds: Vec<BookingEventKind> = (0..3).map(|_| events.try_recv().unwrap().kind).collect();
    assert_eq!(
        kinds,
        vec![BookingEventKind::Accepted, BookingEventKind::Rejected, BookingEventKind::Accepted]
    );

    let stats = pipeline.queue.stats().await.unwrap();
    assert_eq!(stats, QueueStats::default());
}

#[tokio::test]
async fn test_non_overlapping_requests_are_all_accepted() {
    let pipeline = TestPipeline::new().await;

    // Back-to-back half-hour slots from 08:00 to 18:00.
    for slot in 0..20 {
        let start = monday_at(8, 0) + ChronoDuration::minutes(30 * slot);
        let request = pipeline.request(Uuid::new_v4(), start, start + ChronoDuration::minutes(30));
        pipeline.producer.submit(request).await.unwrap();
    }

    let outcomes = pipeline.worker.process_batch(pipeline.drain_deliveries().await).await;

    assert_eq!(outcomes.len(), 20);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_accepted()));
    assert_eq!(pipeline.store.bookings_for(pipeline.schedule.id).await.len(), 20);
}

#[tokio::test]
async fn test_pairwise_overlapping_requests_have_one_winner() {
    let pipeline = TestPipeline::new().await;

    // All contain 12:00-12:15.
    for offset in 0..10 {
        let start = monday_at(11, 0) + ChronoDuration::minutes(5 * offset);
        let request = pipeline.request(Uuid::new_v4(), start, monday_at(12, 15) + ChronoDuration::minutes(offset));
        pipeline.producer.submit(request).await.unwrap();
    }

    let outcomes = pipeline.worker.process_batch(pipeline.drain_deliveries().await).await;

    assert_eq!(outcomes.iter().filter(|(_, outcome)| outcome.is_accepted()).count(), 1);
    assert!(outcomes[0].1.is_accepted());
    assert_eq!(pipeline.store.bookings_for(pipeline.schedule.id).await.len(), 1);
}

#[tokio::test]
async fn test_requested_status_is_kept_on_insert() {
    let pipeline = TestPipeline::new().await;
    let mut request = pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0));
    request.status = Some(BookingStatus::Confirmed);

    let outcome = pipeline.submit_and_process(request).await;

    assert_matches!(outcome, IngestOutcome::Accepted(booking) if booking.status == BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_request_outside_schedule_window_is_dropped() {
    let pipeline = TestPipeline::new().await;
    let mut events = pipeline.events.subscribe();

    let outcome = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(7, 30), monday_at(8, 30)))
        .await;

    assert_eq!(outcome, IngestOutcome::OutsideSchedule);
    assert!(pipeline.store.bookings_for(pipeline.schedule.id).await.is_empty());
    assert_eq!(events.try_recv().unwrap().kind, BookingEventKind::Rejected);
    assert_eq!(pipeline.queue.stats().await.unwrap().in_flight, 0);
}

#[tokio::test]
async fn test_cancelled_booking_releases_its_slot() {
    let pipeline = TestPipeline::new().await;

    let first = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;
    let IngestOutcome::Accepted(booking) = first else {
        panic!("expected first booking to be accepted, got {:?}", first);
    };

    pipeline
        .store
        .set_status(booking.id, BookingStatus::Cancelled)
        .await
        .unwrap();

    let second = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;
    assert!(second.is_accepted());
}

#[tokio::test]
async fn test_redelivery_of_accepted_request_is_a_duplicate() {
    let pipeline = TestPipeline::new().await;
    let mut events = pipeline.events.subscribe();

    pipeline
        .producer
        .submit(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await
        .unwrap();
    let delivery = pipeline.queue.receive(Duration::ZERO).await.unwrap().unwrap();

    let first = pipeline.worker.process_delivery(delivery.clone()).await;
    let IngestOutcome::Accepted(booking) = first else {
        panic!("expected acceptance, got {:?}", first);
    };

    // Same message delivered again, as after a lost ack.
    let redelivered = Delivery { receive_count: 2, ..delivery };
    let second = pipeline.worker.process_delivery(redelivered).await;

    assert_eq!(second, IngestOutcome::Duplicate { existing: Some(booking.id) });
    assert_eq!(pipeline.store.bookings_for(pipeline.schedule.id).await.len(), 1);

    assert_eq!(events.try_recv().unwrap().kind, BookingEventKind::Accepted);
    assert!(events.try_recv().is_err(), "a replay must not notify twice");
}

#[tokio::test]
async fn test_uniqueness_backstop_turns_race_into_duplicate() {
    let pipeline = TestPipeline::with_store_wrapper(|store| {
        Arc::new(BlindStore { inner: store }) as Arc<dyn BookingStore>
    })
    .await;
    let mut events = pipeline.events.subscribe();

    let first = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;
    assert!(first.is_accepted());

    let second = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(9, 30)))
        .await;

    assert_eq!(second, IngestOutcome::Duplicate { existing: None });
    assert_eq!(pipeline.store.bookings_for(pipeline.schedule.id).await.len(), 1);

    assert_eq!(events.try_recv().unwrap().kind, BookingEventKind::Accepted);
    assert_eq!(events.try_recv().unwrap().kind, BookingEventKind::Rejected);
}

#[tokio::test]
async fn test_transient_failures_are_retried_in_place() {
    let mut flaky = None;
    let pipeline = TestPipeline::with_store_wrapper(|store| {
        let wrapped = Arc::new(FlakyStore::new(store, 2, StoreError::Unavailable("timeout".to_string())));
        flaky = Some(wrapped.clone());
        wrapped as Arc<dyn BookingStore>
    })
    .await;
    let flaky = flaky.unwrap();

    let outcome = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;

    assert!(outcome.is_accepted());
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.queue.stats().await.unwrap().dead_lettered, 0);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_the_message() {
    let mut flaky = None;
    let pipeline = TestPipeline::with_store_wrapper(|store| {
        let wrapped = Arc::new(FlakyStore::new(store, 100, StoreError::Unavailable("down".to_string())));
        flaky = Some(wrapped.clone());
        wrapped as Arc<dyn BookingStore>
    })
    .await;
    let flaky = flaky.unwrap();
    let mut events = pipeline.events.subscribe();

    let outcome = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;

    assert_matches!(outcome, IngestOutcome::DeadLettered { reason } if reason.contains("retry budget exhausted"));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), pipeline.worker.config().max_attempts);

    let stats = pipeline.queue.stats().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.in_flight, 0);

    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, BookingEventKind::DeadLettered);
    assert_eq!(event.schedule_id, Some(pipeline.schedule.id));
}

#[tokio::test]
async fn test_permanent_store_errors_are_not_retried() {
    let mut flaky = None;
    let pipeline = TestPipeline::with_store_wrapper(|store| {
        let wrapped = Arc::new(FlakyStore::new(store, 1, StoreError::Rejected("permission denied".to_string())));
        flaky = Some(wrapped.clone());
        wrapped as Arc<dyn BookingStore>
    })
    .await;
    let flaky = flaky.unwrap();

    let outcome = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;

    assert_matches!(outcome, IngestOutcome::DeadLettered { .. });
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_schedule_is_dead_lettered() {
    let pipeline = TestPipeline::new().await;
    pipeline.store.remove_schedule(pipeline.schedule.id).await;

    let outcome = pipeline
        .submit_and_process(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await;

    assert_matches!(outcome, IngestOutcome::DeadLettered { reason } if reason.contains("Unknown schedule"));
    let letters = pipeline.queue.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].group_key, format!("schedule-{}", pipeline.schedule.id));
}

#[tokio::test]
async fn test_poison_message_does_not_block_its_lane() {
    let pipeline = TestPipeline::new().await;
    let lane = format!("schedule-{}", pipeline.schedule.id);

    let poison_id = pipeline.queue.enqueue_raw(&lane, "{not json").await;
    pipeline
        .producer
        .submit(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await
        .unwrap();

    let outcomes = pipeline.worker.process_batch(pipeline.drain_deliveries().await).await;

    assert_eq!(outcomes[0].0, poison_id);
    assert_matches!(&outcomes[0].1, IngestOutcome::DeadLettered { reason } if reason.contains("Malformed"));
    assert!(outcomes[1].1.is_accepted());
}

#[tokio::test]
async fn test_message_on_the_wrong_lane_is_rejected() {
    let pipeline = TestPipeline::new().await;
    let message = QueueMessage::new(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)));
    let payload = serde_json::to_string(&message).unwrap();

    pipeline.queue.enqueue_raw("schedule-elsewhere", &payload).await;
    let delivery = pipeline.queue.receive(Duration::ZERO).await.unwrap().unwrap();

    let outcome = pipeline.worker.process_delivery(delivery).await;
    assert_matches!(outcome, IngestOutcome::DeadLettered { reason } if reason.contains("does not match"));
    assert!(pipeline.store.bookings_for(pipeline.schedule.id).await.is_empty());
}

#[tokio::test]
async fn test_crash_looping_delivery_is_dead_lettered() {
    let pipeline = TestPipeline::new().await;
    pipeline
        .producer
        .submit(pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)))
        .await
        .unwrap();
    let delivery = pipeline.queue.receive(Duration::ZERO).await.unwrap().unwrap();
    let limit = pipeline.worker.config().max_receive_count;

    let outcome = pipeline
        .worker
        .process_delivery(Delivery { receive_count: limit + 1, ..delivery })
        .await;

    assert_matches!(outcome, IngestOutcome::DeadLettered { .. });
    assert!(pipeline.store.bookings_for(pipeline.schedule.id).await.is_empty());
    assert_eq!(pipeline.queue.dead_letters(1).await.unwrap()[0].receive_count, limit + 1);
}

#[tokio::test]
async fn test_batch_lanes_are_independent() {
    let pipeline = TestPipeline::new().await;
    let other = test_schedule();
    pipeline.store.add_schedule(other.clone()).await;

    let requests = [
        pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)),
        super::booking_request(other.id, Uuid::new_v4(), monday_at(9, 0), monday_at(10, 0)),
        pipeline.request(Uuid::new_v4(), monday_at(9, 0), monday_at(9, 45)),
        super::booking_request(other.id, Uuid::new_v4(), monday_at(9, 15), monday_at(10, 15)),
    ];
    for request in requests {
        pipeline.producer.submit(request).await.unwrap();
    }

    let deliveries = pipeline.drain_deliveries().await;
    let lanes = group_by_lane(deliveries.clone());
    assert_eq!(lanes.len(), 2);
    assert!(lanes.iter().all(|(_, lane)| lane.len() == 2));

    let submitted_order: Vec<Uuid> = deliveries.iter().map(|d| d.message_id).collect();
    let outcomes = pipeline.worker.process_batch(deliveries).await;

    // Results line up with the input, not with the lanes.
    let result_order: Vec<Uuid> = outcomes.iter().map(|(id, _)| *id).collect();
    assert_eq!(result_order, submitted_order);
    let labels: Vec<&str> = outcomes.iter().map(|(_, outcome)| outcome.label()).collect();
    assert_eq!(labels, vec!["accepted", "accepted", "conflict", "conflict"]);

    assert_eq!(pipeline.store.bookings_for(pipeline.schedule.id).await.len(), 1);
    assert_eq!(pipeline.store.bookings_for(other.id).await.len(), 1);
}

#[tokio::test]
async fn test_random_load_never_double_books() {
    let pipeline = TestPipeline::new().await;
    let mut rng = StdRng::seed_from_u64(42);

    let mut submitted = Vec::new();
    for _ in 0..150 {
        let start = monday_at(8, 0) + ChronoDuration::minutes(15 * rng.gen_range(0..36));
        let end = start + ChronoDuration::minutes(15 * rng.gen_range(1..6));
        let request = pipeline.request(Uuid::new_v4(), start, end);
        pipeline.producer.submit(request.clone()).await.unwrap();
        submitted.push(request);
    }

    let outcomes = pipeline.worker.process_batch(pipeline.drain_deliveries().await).await;
    assert_eq!(outcomes.len(), submitted.len());

    let bookings = pipeline.store.bookings_for(pipeline.schedule.id).await;
    assert_no_overlaps(&bookings);

    // FIFO within the lane: replaying the same order greedily gives the same winners.
    let mut expected: Vec<&BookingRequest> = Vec::new();
    for request in &submitted {
        let fits = request.end_time.time() <= monday_at(18, 0).time()
            && expected
                .iter()
                .all(|won| !overlaps(won.start_time, won.end_time, request.start_time, request.end_time));
        if fits {
            expected.push(request);
        }
    }

    let accepted: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|(_, outcome)| match outcome {
            IngestOutcome::Accepted(booking) => Some(booking.patient_id),
            _ => None,
        })
        .collect();
    let expected_patients: Vec<Uuid> = expected.iter().map(|r| r.patient_id).collect();
    assert_eq!(accepted, expected_patients);
    assert_eq!(bookings.len(), accepted.len());
}
