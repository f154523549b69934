//! Engine and consumer configuration
//!
//! `EngineConfig` tunes a backend (idle wait, retry policy, Redis key layout).
//! `ConsumeOptions` tunes a single `consume` call (batch size, worker count).

use crate::retry::RetryPolicy;
use core_config::queue::QueueSettings;
use std::time::Duration;
use uuid::Uuid;

/// Per-consumer options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum messages handed to the handler at once
    pub max_batch: usize,

    /// Number of independent worker loops
    pub max_concurrent: usize,
}

impl ConsumeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size (at least 1)
    pub fn with_max_batch(mut self, size: usize) -> Self {
        self.max_batch = size.max(1);
        self
    }

    /// Set the worker count (at least 1)
    pub fn with_max_concurrent(mut self, count: usize) -> Self {
        self.max_concurrent = count.max(1);
        self
    }

    /// Build options from loaded queue settings
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new()
            .with_max_batch(settings.max_batch)
            .with_max_concurrent(settings.max_concurrent)
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            max_batch: 10,
            max_concurrent: 1,
        }
    }
}

/// Shortest idle wait; an empty topic is never polled in a tight loop
pub const MIN_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Backend configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep between polls of an empty topic
    pub idle_wait: Duration,

    /// Retry budget and backoff
    pub retry: RetryPolicy,

    /// Prefix for every Redis key this queue owns
    pub key_prefix: String,

    /// Consumer group name (Redis backend)
    pub consumer_group: String,

    /// Consumer name prefix (random per process unless configured)
    pub consumer_id: String,

    /// Idle time after which another consumer's unacknowledged entries are reclaimed
    pub claim_idle: Duration,

    /// Maximum DLQ stream length before trimming
    pub dlq_max_length: i64,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from loaded queue settings
    pub fn from_settings(settings: &QueueSettings) -> Self {
        let mut config = Self::new()
            .with_key_prefix(settings.key_prefix.clone())
            .with_consumer_group(settings.consumer_group.clone())
            .with_idle_wait(Duration::from_millis(settings.idle_wait_ms))
            .with_claim_idle(Duration::from_millis(settings.claim_idle_ms))
            .with_retry(RetryPolicy::new(
                Duration::from_millis(settings.retry_base_ms),
                Duration::from_millis(settings.retry_max_ms),
            ));
        if let Some(name) = &settings.consumer_name {
            config = config.with_consumer_id(name.clone());
        }
        config
    }

    /// Set the idle wait (at least `MIN_IDLE_WAIT`)
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait.max(MIN_IDLE_WAIT);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the Redis key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the consumer group
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the consumer ID
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the reclaim idle time
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    /// Stream key for a topic
    pub fn topic_stream(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.key_prefix, topic)
    }

    /// Set key tracking every topic that has been published to
    pub fn topics_key(&self) -> String {
        format!("{}:topics", self.key_prefix)
    }

    /// Dead letter stream key
    pub fn dlq_stream(&self) -> String {
        format!("{}:dlq", self.key_prefix)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(50),
            retry: RetryPolicy::default(),
            key_prefix: "webhooks".to_string(),
            consumer_group: "webhook_workers".to_string(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            claim_idle: Duration::from_secs(60),
            dlq_max_length: 10_000,
        }
    }
}
