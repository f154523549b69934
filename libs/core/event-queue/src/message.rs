//! Message envelope
//!
//! The unit of transport for every backend: identity, partition key,
//! payload, publish timestamp and delivery attempt counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queued message.
///
/// Messages are immutable once published except for `attempt`,
/// which only the engines bump when they redeliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    /// Unique message ID (assigned on publish when empty)
    pub id: String,

    /// Partition/ordering key
    pub key: String,

    /// Opaque payload, typed by the topic's consumer
    pub payload: T,

    /// When the message was (re)published
    pub timestamp: DateTime<Utc>,

    /// Number of failed deliveries so far
    #[serde(default)]
    pub attempt: u32,
}

impl<T> Message<T> {
    /// Create a message with no ID yet; the engine assigns one on publish.
    pub fn new(key: impl Into<String>, payload: T) -> Self {
        Self {
            id: String::new(),
            key: key.into(),
            payload,
            timestamp: Utc::now(),
            attempt: 0,
        }
    }

    /// Use an explicit message ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Check if this message has been delivered and failed before
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 0
    }

    /// How long ago the message was published
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }

    /// Stamp the message for publishing: assign an ID if missing, set the timestamp.
    pub(crate) fn stamp(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::now_v7().to_string();
        }
        self.timestamp = Utc::now();
    }

    /// Record a failed delivery, returning the new attempt count.
    pub(crate) fn bump_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }
}
