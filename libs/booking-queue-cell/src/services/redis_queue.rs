use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::services::queue::QueueTransport;
use crate::{BookingQueueError, DeadLetter, Delivery, EnqueueReceipt, QueueMessage, QueueStats};

const QUEUE_PENDING: &str = "booking_queue:pending";
const QUEUE_PROCESSING: &str = "booking_queue:processing";
const QUEUE_DEAD_LETTER: &str = "booking_queue:dead_letter";
const CONSUMER_LEASE: &str = "booking_queue:consumer_lease";

// Take the lease when it is free or already ours, refreshing its TTL.
const CLAIM_LEASE_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder == false or holder == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn message_key(message_id: Uuid) -> String {
    format!("booking_queue:message:{}", message_id)
}

/// Dedup keys embed timestamps and ids; hashing keeps the Redis key bounded.
fn dedup_key(dedup_key: &str) -> String {
    format!("booking_queue:dedup:{:x}", Sha256::digest(dedup_key.as_bytes()))
}

/// Redis-backed transport.
///
/// `booking_queue:pending` is a FIFO list (LPUSH in, BRPOPLPUSH out into
/// `booking_queue:processing`); message bodies live in per-message hashes.
/// Instances sharing one Redis coordinate through `booking_queue:consumer_lease`
/// so only one of them receives at a time.
pub struct RedisQueueService {
    pool: Pool,
    dedup_window: Duration,
}

impl RedisQueueService {
    pub async fn new(redis_url: &str, dedup_window: Duration) -> Result<Self, BookingQueueError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BookingQueueError::QueueUnavailable(format!("Pool creation error: {}", e)))?;

        let service = Self { pool, dedup_window };

        // Test connection
        let mut conn = service.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis queue service initialized successfully");

        Ok(service)
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, BookingQueueError> {
        let redis_url = config
            .redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());
        Self::new(
            &redis_url,
            Duration::from_secs(config.booking_queue.dedup_window_secs),
        )
        .await
    }

    async fn get_connection(&self) -> Result<Connection, BookingQueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| BookingQueueError::QueueUnavailable(format!("Failed to get Redis connection: {}", e)))
    }

    async fn load_message(
        &self,
        conn: &mut Connection,
        message_id: Uuid,
    ) -> Result<Option<HashMap<String, String>>, BookingQueueError> {
        let fields: HashMap<String, String> = conn.hgetall(message_key(message_id)).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn pop_pending(
        &self,
        conn: &mut Connection,
        wait: Duration,
    ) -> Result<Option<String>, BookingQueueError> {
        if wait.is_zero() {
            // BRPOPLPUSH with timeout 0 would block forever.
            let id: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(QUEUE_PENDING)
                .arg(QUEUE_PROCESSING)
                .query_async(conn)
                .await?;
            return Ok(id);
        }

        let id: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(QUEUE_PENDING)
            .arg(QUEUE_PROCESSING)
            .arg(wait.as_secs_f64())
            .query_async(conn)
            .await?;
        Ok(id)
    }
}

fn parse_count(fields: &HashMap<String, String>) -> u32 {
    fields
        .get("receive_count")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl QueueTransport for RedisQueueService {
    async fn enqueue(&self, message: &QueueMessage) -> Result<EnqueueReceipt, BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let payload = serde_json::to_string(message)?;
        let dedup = dedup_key(&message.dedup_key);

        let claimed: Option<String> = redis::cmd("SET")
            .arg(&dedup)
            .arg(message.message_id.to_string())
            .arg("NX")
            .arg("EX")
            .arg(self.dedup_window.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if claimed.is_none() {
            let original: Option<String> = conn.get(&dedup).await?;
            if let Some(original_id) = original.and_then(|raw| Uuid::parse_str(&raw).ok()) {
                debug!("Collapsed duplicate submission {} onto {}", message.dedup_key, original_id);
                return Ok(EnqueueReceipt {
                    message_id: original_id,
                    duplicate: true,
                });
            }
            // The dedup entry expired between SET and GET; carry on as a new message.
        }

        let stored: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .hset_multiple(
                message_key(message.message_id),
                &[
                    ("group", message.group_key.as_str()),
                    ("payload", payload.as_str()),
                    ("receive_count", "0"),
                ],
            )
            .ignore()
            .lpush(QUEUE_PENDING, message.message_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await;

        if let Err(e) = stored {
            // Release the dedup claim so the client's retry is not swallowed.
            let _: Result<(), redis::RedisError> = conn.del(&dedup).await;
            return Err(e.into());
        }

        debug!("Message {} enqueued on lane {}", message.message_id, message.group_key);
        Ok(EnqueueReceipt {
            message_id: message.message_id,
            duplicate: false,
        })
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BookingQueueError> {
        let mut conn = self.get_connection().await?;

        let Some(raw_id) = self.pop_pending(&mut conn, wait).await? else {
            return Ok(None);
        };

        let Ok(message_id) = Uuid::parse_str(&raw_id) else {
            warn!("Dropping unparseable message id {:?} from processing list", raw_id);
            let _: () = conn.lrem(QUEUE_PROCESSING, 1, &raw_id).await?;
            return Ok(None);
        };

        let Some(fields) = self.load_message(&mut conn, message_id).await? else {
            warn!("Message {} has no body, dropping", message_id);
            let _: () = conn.lrem(QUEUE_PROCESSING, 1, &raw_id).await?;
            return Ok(None);
        };

        let receive_count: u32 = conn.hincr(message_key(message_id), "receive_count", 1).await?;

        Ok(Some(Delivery {
            message_id,
            group_key: fields.get("group").cloned().unwrap_or_default(),
            payload: fields.get("payload").cloned().unwrap_or_default(),
            receive_count,
        }))
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(QUEUE_PROCESSING, 1, message_id.to_string())
            .ignore()
            .del(message_key(message_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let id = delivery.message_id.to_string();
        let receive_count = delivery.receive_count.to_string();
        let dead_lettered_at = Utc::now().to_rfc3339();

        let _: () = redis::pipe()
            .atomic()
            .lrem(QUEUE_PROCESSING, 1, &id)
            .ignore()
            .hset_multiple(
                message_key(delivery.message_id),
                &[
                    ("group", delivery.group_key.as_str()),
                    ("payload", delivery.payload.as_str()),
                    ("receive_count", receive_count.as_str()),
                    ("reason", reason),
                    ("dead_lettered_at", dead_lettered_at.as_str()),
                ],
            )
            .ignore()
            .lpush(QUEUE_DEAD_LETTER, &id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BookingQueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.lrange(QUEUE_DEAD_LETTER, 0, limit as isize - 1).await?;

        let mut letters = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(message_id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            let Some(fields) = self.load_message(&mut conn, message_id).await? else {
                continue;
            };
            letters.push(DeadLetter {
                message_id,
                group_key: fields.get("group").cloned().unwrap_or_default(),
                payload: fields.get("payload").cloned().unwrap_or_default(),
                reason: fields.get("reason").cloned().unwrap_or_default(),
                receive_count: parse_count(&fields),
                dead_lettered_at: fields
                    .get("dead_lettered_at")
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|at| at.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(letters)
    }

    async fn requeue_dead_letter(&self, message_id: Uuid) -> Result<bool, BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let id = message_id.to_string();

        let removed: i64 = conn.lrem(QUEUE_DEAD_LETTER, 1, &id).await?;
        if removed == 0 {
            return Ok(false);
        }

        let _: () = redis::pipe()
            .atomic()
            .hset(message_key(message_id), "receive_count", 0)
            .ignore()
            .hdel(message_key(message_id), vec!["reason", "dead_lettered_at"])
            .ignore()
            .lpush(QUEUE_PENDING, &id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!("Dead letter {} requeued", message_id);
        Ok(true)
    }

    async fn recover_in_flight(&self) -> Result<u64, BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let mut recovered = 0u64;

        // Newest in-flight first onto the consuming end keeps the oldest at the head.
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(QUEUE_PROCESSING)
                .arg(QUEUE_PENDING)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            warn!("Recovered {} in-flight messages", recovered);
        }
        Ok(recovered)
    }

    async fn claim_consumer(&self, holder: &str, ttl: Duration) -> Result<bool, BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let claimed: i64 = redis::Script::new(CLAIM_LEASE_SCRIPT)
            .key(CONSUMER_LEASE)
            .arg(holder)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn release_consumer(&self, holder: &str) -> Result<(), BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let released: i64 = redis::Script::new(RELEASE_LEASE_SCRIPT)
            .key(CONSUMER_LEASE)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        if released == 1 {
            debug!("Consumer lease released by {}", holder);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, BookingQueueError> {
        let mut conn = self.get_connection().await?;
        let pending: u64 = conn.llen(QUEUE_PENDING).await?;
        let in_flight: u64 = conn.llen(QUEUE_PROCESSING).await?;
        let dead_lettered: u64 = conn.llen(QUEUE_DEAD_LETTER).await?;

        Ok(QueueStats { pending, in_flight, dead_lettered })
    }
}
