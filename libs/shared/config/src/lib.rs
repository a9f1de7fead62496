use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub supabase_service_role_key: String,
    pub redis_url: Option<String>,
    pub server_port: u16,
    pub booking_queue: BookingQueueSettings,
}

/// Tuning knobs for the booking queue pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingQueueSettings {
    /// Attempts per delivery before a transient failure is dead-lettered.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Deliveries received more often than this are treated as crash loops.
    pub max_receive_count: u32,
    pub dedup_window_secs: u64,
    pub receive_wait_ms: u64,
    pub max_concurrent_lanes: usize,
    /// Received but unsettled deliveries across all lanes before receiving pauses.
    pub max_in_flight: usize,
    pub lane_idle_secs: u64,
    /// TTL of the lease that makes one instance the only active consumer.
    pub consumer_lease_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for BookingQueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 200,
            max_receive_count: 5,
            dedup_window_secs: 300,
            receive_wait_ms: 1000,
            max_concurrent_lanes: 16,
            max_in_flight: 256,
            lane_idle_secs: 60,
            consumer_lease_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

impl BookingQueueSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_number("BOOKING_QUEUE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            retry_delay_ms: env_number("BOOKING_QUEUE_RETRY_DELAY_MS", defaults.retry_delay_ms),
            max_receive_count: env_number("BOOKING_QUEUE_MAX_RECEIVE_COUNT", defaults.max_receive_count).max(1),
            dedup_window_secs: env_number("BOOKING_QUEUE_DEDUP_WINDOW_SECS", defaults.dedup_window_secs),
            receive_wait_ms: env_number("BOOKING_QUEUE_RECEIVE_WAIT_MS", defaults.receive_wait_ms),
            max_concurrent_lanes: env_number("BOOKING_QUEUE_MAX_CONCURRENT_LANES", defaults.max_concurrent_lanes).max(1),
            max_in_flight: env_number("BOOKING_QUEUE_MAX_IN_FLIGHT", defaults.max_in_flight).max(1),
            lane_idle_secs: env_number("BOOKING_QUEUE_LANE_IDLE_SECS", defaults.lane_idle_secs),
            consumer_lease_secs: env_number("BOOKING_QUEUE_CONSUMER_LEASE_SECS", defaults.consumer_lease_secs).max(1),
            shutdown_timeout_secs: env_number("BOOKING_QUEUE_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout_secs),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, booking store will fall back to memory");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            server_port: env_number("SERVER_PORT", 3000),
            booking_queue: BookingQueueSettings::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// The booking store talks to PostgREST with the service role key.
    pub fn is_booking_store_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_service_role_key.is_empty()
    }
}

fn env_number<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
