use std::time::Duration;

/// Reads an environment variable, falling back to `default` when absent or
/// unparsable, following the reference server's `DbConfig::default()`
/// env-with-fallback pattern.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Loads a `.env` file if present, matching the reference server's
/// `dotenvy::dotenv().ok()` startup call. Safe to call from every binary.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// KV (Redis) connection settings shared by the gateway (fan-out) and the
/// readiness probes of every service.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            addr: env_string_or("REDIS_ADDR", "127.0.0.1:6379"),
            password: std::env::var("REDIS_PASS").ok().filter(|p| !p.is_empty()),
            db: env_or("REDIS_DB", 0),
        }
    }

    pub fn connection_url(&self) -> String {
        let auth = self
            .password
            .as_ref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!("redis://{auth}{}/{}", self.addr, self.db)
    }
}

/// AMQP broker connection + topology settings.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub user: String,
    pub pass: String,
    pub host: String,
    pub message_queue: String,
    pub message_exchange: String,
    pub dispatched_queue: String,
}

impl AmqpConfig {
    pub fn from_env() -> Self {
        Self {
            user: env_string_or("AMQP_USER", "guest"),
            pass: env_string_or("AMQP_PASS", "guest"),
            host: env_string_or("AMQP_HOST", "127.0.0.1:5672"),
            message_queue: env_string_or("MSG_QUEUE", "messages"),
            message_exchange: env_string_or("MSG_EXCHANGE", "message.dispatched"),
            dispatched_queue: env_string_or("READER_DISPATCH_QUEUE", "message_dispatched_reader"),
        }
    }

    pub fn connection_url(&self) -> String {
        format!("amqp://{}:{}@{}/%2f", self.user, self.pass, self.host)
    }
}

/// Store (MongoDB) connection settings.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub messages_collection: String,
    pub outbox_collection: String,
}

impl MongoConfig {
    pub fn from_env() -> Self {
        Self {
            uri: env_string_or("MONGO_URI", "mongodb://127.0.0.1:27017"),
            database: env_string_or("MONGO_DB", "chat"),
            messages_collection: env_string_or("MONGO_MESSAGES_COLLECTION", "messages"),
            outbox_collection: env_string_or("MONGO_OUTBOX_COLLECTION", "messages_outbox"),
        }
    }
}

/// FanoutHub tuning knobs: mailbox buffer size and slow-consumer enqueue
/// deadline.
#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    pub mailbox_capacity: usize,
    pub enqueue_deadline: Duration,
}

impl FanoutConfig {
    pub fn from_env() -> Self {
        Self {
            mailbox_capacity: env_or("SUBS_CHAN_BUFFER_SIZE", 30),
            enqueue_deadline: Duration::from_millis(env_or("FANOUT_ENQUEUE_DEADLINE_MS", 100)),
        }
    }
}

/// WorkerPool tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
}

impl WorkerPoolConfig {
    pub fn from_env(key: &str) -> Self {
        Self {
            concurrency: env_or(key, 10),
        }
    }
}

/// HistoryReader cache/pagination knobs.
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    pub page_size: i64,
    pub cache_ttl: Duration,
}

impl HistoryConfig {
    pub fn from_env() -> Self {
        Self {
            page_size: env_or("MESSAGE_PAGE_SIZE", 20),
            cache_ttl: Duration::from_secs(env_or::<u64>("CACHE_TTL_HOURS", 6) * 3600),
        }
    }
}
