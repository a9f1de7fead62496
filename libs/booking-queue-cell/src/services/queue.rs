use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{BookingQueueError, DeadLetter, Delivery, EnqueueReceipt, QueueMessage, QueueStats};

/// An ordered, deduplicating queue with a dead-letter side channel.
///
/// Transports deliver in enqueue order. Per-lane serialization is the
/// consumer's job; the transport only has to preserve that order.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Collapses messages whose dedup key was seen within the dedup window.
    async fn enqueue(&self, message: &QueueMessage) -> Result<EnqueueReceipt, BookingQueueError>;

    /// Waits up to `wait` for the next delivery.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BookingQueueError>;

    async fn ack(&self, message_id: Uuid) -> Result<(), BookingQueueError>;

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BookingQueueError>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BookingQueueError>;

    /// Puts a dead letter back on the queue. `false` when the id is unknown.
    async fn requeue_dead_letter(&self, message_id: Uuid) -> Result<bool, BookingQueueError>;

    /// Returns deliveries abandoned by a crashed consumer to the head of the queue.
    /// Only the holder of the consumer lease may call this.
    async fn recover_in_flight(&self) -> Result<u64, BookingQueueError>;

    /// Claims or renews the consumer lease for `holder`. At most one holder
    /// receives at a time; `false` while another holder's lease is live.
    async fn claim_consumer(&self, holder: &str, ttl: Duration) -> Result<bool, BookingQueueError>;

    /// Gives the lease up early. A no-op unless `holder` owns it.
    async fn release_consumer(&self, holder: &str) -> Result<(), BookingQueueError>;

    async fn stats(&self) -> Result<QueueStats, BookingQueueError>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message_id: Uuid,
    group_key: String,
    payload: String,
    receive_count: u32,
}

impl StoredMessage {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            message_id: self.message_id,
            group_key: self.group_key.clone(),
            payload: self.payload.clone(),
            receive_count: self.receive_count,
        }
    }
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    pending: VecDeque<StoredMessage>,
    in_flight: HashMap<Uuid, StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    dedup: HashMap<String, (Uuid, Instant)>,
    consumer_lease: Option<(String, Instant)>,
}

impl QueueState {
    fn push(&mut self, message_id: Uuid, group_key: String, payload: String) {
        self.next_seq += 1;
        self.pending.push_back(StoredMessage {
            seq: self.next_seq,
            message_id,
            group_key,
            payload,
            receive_count: 0,
        });
    }
}

/// Process-local transport for tests and single-instance deployments.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    dedup_window: Duration,
}

impl InMemoryQueue {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            dedup_window,
        }
    }

    /// Enqueues an already-serialized payload, bypassing deduplication.
    pub async fn enqueue_raw(&self, group_key: &str, payload: &str) -> Uuid {
        let message_id = Uuid::new_v4();
        self.state
            .lock()
            .await
            .push(message_id, group_key.to_string(), payload.to_string());
        self.notify.notify_waiters();
        message_id
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<EnqueueReceipt, BookingQueueError> {
        let payload = serde_json::to_string(message)?;
        let now = Instant::now();

        {
            let mut state = self.state.lock().await;
            let window = self.dedup_window;
            state.dedup.retain(|_, (_, seen_at)| now.duration_since(*seen_at) < window);

            if let Some((original_id, _)) = state.dedup.get(&message.dedup_key) {
                debug!("Collapsed duplicate submission {} onto {}", message.dedup_key, original_id);
                return Ok(EnqueueReceipt {
                    message_id: *original_id,
                    duplicate: true,
                });
            }

            state
                .dedup
                .insert(message.dedup_key.clone(), (message.message_id, now));
            state.push(message.message_id, message.group_key.clone(), payload);
        }

        self.notify.notify_waiters();
        debug!("Message {} enqueued on lane {}", message.message_id, message.group_key);

        Ok(EnqueueReceipt {
            message_id: message.message_id,
            duplicate: false,
        })
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BookingQueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().await;
                if let Some(mut message) = state.pending.pop_front() {
                    message.receive_count += 1;
                    let delivery = message.to_delivery();
                    state.in_flight.insert(message.message_id, message);
                    return Ok(Some(delivery));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), BookingQueueError> {
        if self.state.lock().await.in_flight.remove(&message_id).is_none() {
            debug!("Ack for message {} that is not in flight", message_id);
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BookingQueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&delivery.message_id);
        state.dead_letters.push(DeadLetter {
            message_id: delivery.message_id,
            group_key: delivery.group_key.clone(),
            payload: delivery.payload.clone(),
            reason: reason.to_string(),
            receive_count: delivery.receive_count,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BookingQueueError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn requeue_dead_letter(&self, message_id: Uuid) -> Result<bool, BookingQueueError> {
        let requeued = {
            let mut state = self.state.lock().await;
            match state.dead_letters.iter().position(|d| d.message_id == message_id) {
                Some(index) => {
                    let letter = state.dead_letters.remove(index);
                    state.push(letter.message_id, letter.group_key, letter.payload);
                    true
                }
                None => false,
            }
        };

        if requeued {
            self.notify.notify_waiters();
            info!("Dead letter {} requeued", message_id);
        }
        Ok(requeued)
    }

    async fn recover_in_flight(&self) -> Result<u64, BookingQueueError> {
        let recovered = {
            let mut state = self.state.lock().await;
            let mut stranded: Vec<StoredMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
            stranded.sort_by_key(|m| m.seq);
            let count = stranded.len() as u64;
            for message in stranded.into_iter().rev() {
                state.pending.push_front(message);
            }
            count
        };

        if recovered > 0 {
            warn!("Recovered {} in-flight messages", recovered);
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn claim_consumer(&self, holder: &str, ttl: Duration) -> Result<bool, BookingQueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let held_elsewhere = matches!(
            &state.consumer_lease,
            Some((current, expires_at)) if current != holder && *expires_at > now
        );
        if held_elsewhere {
            return Ok(false);
        }

        state.consumer_lease = Some((holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_consumer(&self, holder: &str) -> Result<(), BookingQueueError> {
        let mut state = self.state.lock().await;
        if matches!(&state.consumer_lease, Some((current, _)) if current == holder) {
            state.consumer_lease = None;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, BookingQueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            pending: state.pending.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead_lettered: state.dead_letters.len() as u64,
        })
    }
}
