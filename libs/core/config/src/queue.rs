use crate::{env_flag, env_optional, env_or_default, env_parse, ConfigError, FromEnv};

/// Webhook queue settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    /// Request the durable Redis backend
    pub use_redis: bool,
    /// Redis URL; the durable backend is only used when this is set
    pub redis_url: Option<String>,
    /// Prefix for every Redis key the queue owns
    pub key_prefix: String,
    pub max_batch: usize,
    pub max_concurrent: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub idle_wait_ms: u64,
    pub claim_idle_ms: u64,
    /// Redis consumer group shared by every worker process
    pub consumer_group: String,
    /// Stable consumer name, so a restarted worker picks up its own unacknowledged entries
    pub consumer_name: Option<String>,
}

impl QueueSettings {
    /// Both the flag and a URL are needed for the durable backend
    pub fn wants_redis(&self) -> bool {
        self.use_redis && self.redis_url.is_some()
    }
}

impl FromEnv for QueueSettings {
    /// Reads from environment variables:
    /// - QUEUE_USE_REDIS: 1/true/yes/on enables Redis (default: off)
    /// - QUEUE_REDIS_URL: falls back to REDIS_URL
    /// - QUEUE_KEY_PREFIX: defaults to "webhooks"
    /// - QUEUE_MAX_BATCH / QUEUE_MAX_CONCURRENT: default 10 / 1
    /// - QUEUE_RETRY_BASE_MS / QUEUE_RETRY_MAX_MS: default 500 / 30000
    /// - QUEUE_IDLE_WAIT_MS / QUEUE_CLAIM_IDLE_MS: default 50 / 60000
    /// - QUEUE_CONSUMER_GROUP: defaults to "webhook_workers"
    /// - QUEUE_CONSUMER_NAME: falls back to HOSTNAME, then a random name per process
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            use_redis: env_flag("QUEUE_USE_REDIS"),
            redis_url: env_optional("QUEUE_REDIS_URL").or_else(|| env_optional("REDIS_URL")),
            key_prefix: env_or_default("QUEUE_KEY_PREFIX", &defaults.key_prefix),
            max_batch: env_parse("QUEUE_MAX_BATCH", defaults.max_batch)?,
            max_concurrent: env_parse("QUEUE_MAX_CONCURRENT", defaults.max_concurrent)?,
            retry_base_ms: env_parse("QUEUE_RETRY_BASE_MS", defaults.retry_base_ms)?,
            retry_max_ms: env_parse("QUEUE_RETRY_MAX_MS", defaults.retry_max_ms)?,
            idle_wait_ms: env_parse("QUEUE_IDLE_WAIT_MS", defaults.idle_wait_ms)?,
            claim_idle_ms: env_parse("QUEUE_CLAIM_IDLE_MS", defaults.claim_idle_ms)?,
            consumer_group: env_or_default("QUEUE_CONSUMER_GROUP", &defaults.consumer_group),
            consumer_name: env_optional("QUEUE_CONSUMER_NAME").or_else(|| env_optional("HOSTNAME")),
        })
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            use_redis: false,
            redis_url: None,
            key_prefix: "webhooks".to_string(),
            max_batch: 10,
            max_concurrent: 1,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            idle_wait_ms: 50,
            claim_idle_ms: 60_000,
            consumer_group: "webhook_workers".to_string(),
            consumer_name: None,
        }
    }
}
