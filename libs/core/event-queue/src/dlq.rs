//! Dead Letter Queue (DLQ) storage
//!
//! Messages that exhaust their retry budget end up here:
//! - `InMemoryDeadLetters` records them in process (tests, single instance)
//! - `RedisDeadLetters` persists them to the durable backend's DLQ stream

use crate::contract::DeadLetterSink;
use crate::error::QueueError;
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info, warn};

// Type alias for Redis stream entries
type StreamEntries = Vec<(String, Vec<(String, String)>)>;

/// A permanently failed message and why it failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter<T> {
    /// The message as of its final attempt
    pub message: Message<T>,

    /// Failure reason reported by the handler
    pub reason: String,

    /// When the message was dead-lettered
    pub failed_at: DateTime<Utc>,
}

impl<T> DeadLetter<T> {
    pub fn new(message: Message<T>, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Borrowed form of `DeadLetter` with the same wire shape
#[derive(Serialize)]
struct DeadLetterRef<'a, T> {
    message: &'a Message<T>,
    reason: &'a str,
    failed_at: DateTime<Utc>,
}

/// In-process dead letter sink that keeps every entry it receives.
pub struct InMemoryDeadLetters<T> {
    entries: Mutex<Vec<DeadLetter<T>>>,
}

impl<T: Clone> InMemoryDeadLetters<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// All recorded entries, oldest first
    pub fn list(&self) -> Vec<DeadLetter<T>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded entries
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries, returning how many were dropped
    pub fn purge(&self) -> usize {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = entries.len();
        entries.clear();
        count
    }
}

impl<T: Clone> Default for InMemoryDeadLetters<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> DeadLetterSink<T> for InMemoryDeadLetters<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn dead_letter(&self, message: &Message<T>, reason: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(DeadLetter::new(message.clone(), reason));
    }
}

/// DLQ statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub stream_name: String,
    pub length: i64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

/// Dead letter stream on the durable backend
#[derive(Clone)]
pub struct RedisDeadLetters {
    redis: ConnectionManager,
    dlq_stream: String,
    max_length: i64,
}

impl RedisDeadLetters {
    pub fn new(redis: ConnectionManager, dlq_stream: impl Into<String>) -> Self {
        Self {
            redis,
            dlq_stream: dlq_stream.into(),
            max_length: 10_000,
        }
    }

    /// Set the maximum DLQ length
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    /// Get the DLQ stream name
    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }

    /// Append a dead letter, returning its stream entry ID
    pub async fn record<T: Serialize>(
        &self,
        message: &Message<T>,
        reason: &str,
    ) -> Result<String, QueueError> {
        let entry = DeadLetterRef {
            message,
            reason,
            failed_at: Utc::now(),
        };
        let data = serde_json::to_string(&entry)?;
        let mut conn = self.redis.clone();

        let dlq_id: String = redis::cmd("XADD")
            .arg(&self.dlq_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg("data")
            .arg(&data)
            .query_async(&mut conn)
            .await?;

        info!(
            message_id = %message.id,
            dlq_id = %dlq_id,
            reason = %reason,
            attempt = message.attempt,
            "Moved message to DLQ"
        );

        Ok(dlq_id)
    }

    /// Append an entry whose payload could not be decoded
    pub async fn record_raw(&self, raw: &str, reason: &str) -> Result<String, QueueError> {
        let mut conn = self.redis.clone();

        let dlq_id: String = redis::cmd("XADD")
            .arg(&self.dlq_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg("raw")
            .arg(raw)
            .arg("reason")
            .arg(reason)
            .query_async(&mut conn)
            .await?;

        warn!(dlq_id = %dlq_id, reason = %reason, "Moved raw entry to DLQ");
        Ok(dlq_id)
    }

    /// Get DLQ statistics
    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        let mut conn = self.redis.clone();

        let len: i64 = conn.xlen(&self.dlq_stream).await?;

        let oldest: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let newest: StreamEntries = redis::cmd("XREVRANGE")
            .arg(&self.dlq_stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(DlqStats {
            stream_name: self.dlq_stream.clone(),
            length: len,
            oldest_entry_id: oldest.first().map(|(id, _)| id.clone()),
            newest_entry_id: newest.first().map(|(id, _)| id.clone()),
        })
    }

    /// List up to `count` dead letters, oldest first
    pub async fn list<T: DeserializeOwned>(
        &self,
        count: usize,
    ) -> Result<Vec<DeadLetter<T>>, QueueError> {
        let mut conn = self.redis.clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut results = Vec::new();
        for (_id, fields) in entries {
            if let Some(data) = fields.iter().find(|(k, _)| k == "data").map(|(_, v)| v)
                && let Ok(entry) = serde_json::from_str::<DeadLetter<T>>(data)
            {
                results.push(entry);
            }
        }

        Ok(results)
    }

    /// Purge all entries from the DLQ
    pub async fn purge(&self) -> Result<i64, QueueError> {
        let mut conn = self.redis.clone();

        let len: i64 = conn.xlen(&self.dlq_stream).await?;
        if len > 0 {
            let _: () = conn.del(&self.dlq_stream).await?;
            info!(count = len, "Purged DLQ");
        } else {
            debug!("DLQ already empty");
        }

        Ok(len)
    }
}
