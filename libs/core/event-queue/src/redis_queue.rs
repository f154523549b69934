//! Durable queue engine on Redis Streams.
//!
//! Each topic is a stream (`{prefix}:topic:{name}`) read through a consumer
//! group. Entries carry the JSON envelope in a `message` field. Settled
//! entries are acknowledged and deleted, so a stream only ever holds
//! non-terminal messages:
//!
//! ```text
//! XADD -> XREADGROUP (pending list) -> success: XACK + XDEL
//!                                   -> failure: XADD (attempt + 1) or DLQ, then XACK + XDEL
//! ```
//!
//! Entries left in the pending list by a dead consumer are reclaimed with
//! XCLAIM once they have been idle for `claim_idle`. Each worker also re-reads
//! its own pending list on start and every `claim_idle`, which picks up
//! entries it failed to settle and those left by a previous run under the
//! same consumer name.

use crate::config::{ConsumeOptions, EngineConfig};
use crate::contract::{BatchHandler, Consumer, DeadLetterSink, PublishReceipt, Publisher};
use crate::dlq::RedisDeadLetters;
use crate::error::QueueError;
use crate::message::Message;
use crate::metrics::{BatchStatus, QueueMetrics};
use async_trait::async_trait;
use futures::FutureExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const BACKEND: &str = "redis";
const MESSAGE_FIELD: &str = "message";
const MAX_ERROR_BACKOFF_SECS: u64 = 30;

// Type alias for Redis stream entries
type StreamEntries = Vec<(String, Vec<(String, String)>)>;
type SinkSlot<T> = Arc<RwLock<Option<Arc<dyn DeadLetterSink<T>>>>>;

/// A message as stored in a topic stream
#[derive(Debug, Clone)]
pub struct StreamEntry<T> {
    /// Redis stream entry ID (e.g., "1234567890123-0")
    pub entry_id: String,
    /// Decoded envelope
    pub message: Message<T>,
}

/// Connect to Redis and return a ConnectionManager
///
/// Fails with `BackendUnavailable` when the server cannot be reached.
pub async fn connect(url: &str) -> Result<ConnectionManager, QueueError> {
    info!("Connecting to Redis queue backend");

    let client = Client::open(url)?;

    // Single probe first; the manager retries its initial connect with backoff
    let mut probe = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut probe).await?;

    let manager = ConnectionManager::new(client).await?;

    info!("Connected to Redis queue backend");
    Ok(manager)
}

/// Durable queue engine backed by Redis Streams
pub struct RedisQueue<T> {
    redis: ConnectionManager,
    config: EngineConfig,
    dead_letters: RedisDeadLetters,
    dlq: SinkSlot<T>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for RedisQueue<T> {
    fn clone(&self) -> Self {
        Self {
            redis: self.redis.clone(),
            config: self.config.clone(),
            dead_letters: self.dead_letters.clone(),
            dlq: Arc::clone(&self.dlq),
            _phantom: PhantomData,
        }
    }
}

impl<T> RedisQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(redis: ConnectionManager, config: EngineConfig) -> Self {
        let dead_letters = RedisDeadLetters::new(redis.clone(), config.dlq_stream())
            .with_max_length(config.dlq_max_length);
        Self {
            redis,
            config,
            dead_letters,
            dlq: Arc::new(RwLock::new(None)),
            _phantom: PhantomData,
        }
    }

    /// Get the engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dead letter stream for this queue
    pub fn dead_letters(&self) -> &RedisDeadLetters {
        &self.dead_letters
    }

    /// Check connectivity with PING
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Every topic that has been published to since the last drain
    pub async fn topics(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let mut topics: Vec<String> = conn.smembers(self.config.topics_key()).await?;
        topics.sort();
        Ok(topics)
    }

    /// All entries currently stored on a topic, oldest first
    pub async fn list(&self, topic: &str) -> Result<Vec<StreamEntry<T>>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(self.config.topic_stream(topic))
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;

        let (decoded, undecodable) = decode_entries(entries);
        for (entry_id, _) in &undecodable {
            warn!(topic = %topic, entry_id = %entry_id, "Skipping undecodable entry");
        }
        Ok(decoded)
    }

    /// Entry IDs delivered to a consumer but not yet acknowledged
    pub async fn in_flight(&self, topic: &str) -> Result<HashSet<String>, QueueError> {
        let mut conn = self.redis.clone();
        let pending: RedisResult<Vec<(String, String, i64, i64)>> = redis::cmd("XPENDING")
            .arg(self.config.topic_stream(topic))
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(10_000)
            .query_async(&mut conn)
            .await;

        match pending.map_err(QueueError::from) {
            Ok(entries) => Ok(entries.into_iter().map(|(id, _, _, _)| id).collect()),
            Err(e) if e.is_nogroup_error() => Ok(HashSet::new()),
            Err(e) => Err(e),
        }
    }

    /// Remove entries from a topic (acknowledging them first), returning how many were deleted
    pub async fn remove(&self, topic: &str, entry_ids: &[String]) -> Result<usize, QueueError> {
        if entry_ids.is_empty() {
            return Ok(0);
        }

        let stream = self.config.topic_stream(topic);
        let mut conn = self.redis.clone();

        let acked: RedisResult<i64> = redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(entry_ids)
            .query_async(&mut conn)
            .await;
        if let Err(e) = acked.map_err(QueueError::from)
            && !e.is_nogroup_error()
        {
            return Err(e);
        }

        let deleted: i64 = conn.xdel(&stream, entry_ids).await?;
        Ok(deleted.max(0) as usize)
    }

    /// Delete a topic's stream, returning how many entries it held
    pub async fn drain(&self, topic: &str) -> Result<usize, QueueError> {
        let stream = self.config.topic_stream(topic);
        let mut conn = self.redis.clone();

        let len: i64 = conn.xlen(&stream).await?;
        let _: () = conn.del(&stream).await?;
        let _: () = conn.srem(self.config.topics_key(), topic).await?;

        info!(topic = %topic, removed = len, "Drained topic stream");
        Ok(len.max(0) as usize)
    }

    async fn entry_exists(&self, topic: &str, entry_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(self.config.topic_stream(topic))
            .arg(entry_id)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(!entries.is_empty())
    }

    /// Create the consumer group if it doesn't exist
    async fn ensure_group(&self, stream: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg("0") // Start from beginning
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result.map_err(QueueError::from) {
            Ok(()) => {
                info!(stream = %stream, group = %self.config.consumer_group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.is_busygroup_error() => {
                debug!(stream = %stream, group = %self.config.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read up to `count` new entries for this consumer
    async fn read_new(
        &self,
        stream: &str,
        consumer: &str,
        count: usize,
    ) -> Result<StreamEntries, QueueError> {
        let mut conn = self.redis.clone();

        let result: Option<Vec<(String, StreamEntries)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        Ok(result
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .collect())
    }

    /// Re-read entries already delivered to this consumer but never acknowledged
    ///
    /// Returns the entries after `cursor` and, when the page was full, the
    /// cursor to continue from.
    async fn read_own_pending(
        &self,
        stream: &str,
        consumer: &str,
        cursor: &str,
        count: usize,
    ) -> Result<(StreamEntries, Option<String>), QueueError> {
        let mut conn = self.redis.clone();

        // Entries deleted while pending come back with nil fields
        let result: Option<Vec<(String, Vec<(String, Option<Vec<(String, String)>>)>)>> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&self.config.consumer_group)
                .arg(consumer)
                .arg("COUNT")
                .arg(count)
                .arg("STREAMS")
                .arg(stream)
                .arg(cursor) // Pending list only, from this id on
                .query_async(&mut conn)
                .await?;

        let page: Vec<(String, Option<Vec<(String, String)>>)> = result
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .collect();
        let next_cursor = if page.len() >= count {
            page.last().map(|(entry_id, _)| entry_id.clone())
        } else {
            None
        };

        let mut entries = Vec::new();
        let mut vanished = Vec::new();
        for (entry_id, fields) in page {
            match fields {
                Some(fields) => entries.push((entry_id, fields)),
                None => vanished.push(entry_id),
            }
        }

        if !vanished.is_empty() {
            let _: i64 = redis::cmd("XACK")
                .arg(stream)
                .arg(&self.config.consumer_group)
                .arg(&vanished)
                .query_async(&mut conn)
                .await?;
        }
        if !entries.is_empty() {
            warn!(stream = %stream, consumer = %consumer, count = entries.len(), "Redelivering unacknowledged messages");
        }
        Ok((entries, next_cursor))
    }

    /// Claim entries abandoned by other consumers
    async fn claim_abandoned(
        &self,
        stream: &str,
        consumer: &str,
        count: usize,
    ) -> Result<StreamEntries, QueueError> {
        let mut conn = self.redis.clone();
        let min_idle_ms = self.config.claim_idle.as_millis() as i64;

        let pending: Vec<(String, String, i64, i64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let claim_ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, owner, idle_ms, _)| owner != consumer && *idle_ms > min_idle_ms)
            .map(|(id, _, _, _)| id)
            .collect();

        if claim_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for id in &claim_ids {
            cmd.arg(id);
        }

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;
        if !entries.is_empty() {
            warn!(stream = %stream, count = entries.len(), "Claimed abandoned messages");
        }
        Ok(entries)
    }

    async fn append(&self, topic: &str, message: &Message<T>) -> Result<String, QueueError> {
        let json = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();

        let _: () = conn.sadd(self.config.topics_key(), topic).await?;
        let entry_id: String = redis::cmd("XADD")
            .arg(self.config.topic_stream(topic))
            .arg("*")
            .arg(MESSAGE_FIELD)
            .arg(&json)
            .query_async(&mut conn)
            .await?;

        Ok(entry_id)
    }

    fn dlq_sink(&self) -> Option<Arc<dyn DeadLetterSink<T>>> {
        self.dlq
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn worker_loop(
        self,
        worker_id: usize,
        topic: String,
        handler: Arc<dyn BatchHandler<T>>,
        max_batch: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let stream = self.config.topic_stream(&topic);
        let consumer = format!("{}-{}", self.config.consumer_id, worker_id);
        let claim_interval = self.config.claim_idle * 2;
        let mut last_claim = Instant::now();
        // Some while a pass over our own pending list is due; starts with one
        let mut own_pending_cursor: Option<String> = Some("0".to_string());
        let mut last_own_pending = Instant::now();
        let mut consecutive_errors: u32 = 0;

        debug!(topic = %topic, consumer = %consumer, "Worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if own_pending_cursor.is_none() && last_own_pending.elapsed() >= self.config.claim_idle {
                own_pending_cursor = Some("0".to_string());
            }

            let read = if let Some(cursor) = own_pending_cursor.take() {
                last_own_pending = Instant::now();
                match self.read_own_pending(&stream, &consumer, &cursor, max_batch).await {
                    Ok((pending, next)) => {
                        own_pending_cursor = next;
                        if pending.is_empty() {
                            self.read_new(&stream, &consumer, max_batch).await
                        } else {
                            Ok(pending)
                        }
                    }
                    Err(e) => Err(e),
                }
            } else if worker_id == 0 && last_claim.elapsed() >= claim_interval {
                last_claim = Instant::now();
                match self.claim_abandoned(&stream, &consumer, max_batch).await {
                    Ok(claimed) if !claimed.is_empty() => Ok(claimed),
                    Ok(_) => self.read_new(&stream, &consumer, max_batch).await,
                    Err(e) => Err(e),
                }
            } else {
                self.read_new(&stream, &consumer, max_batch).await
            };

            let wait = match read {
                Ok(entries) if entries.is_empty() => {
                    consecutive_errors = 0;
                    self.config.idle_wait
                }
                Ok(entries) => {
                    consecutive_errors = 0;
                    self.run_batch(&topic, &consumer, handler.as_ref(), entries, &mut shutdown)
                        .await;
                    continue;
                }
                Err(e) if e.is_nogroup_error() => {
                    warn!(stream = %stream, "Consumer group missing, recreating");
                    if let Err(create_err) = self.ensure_group(&stream).await {
                        error!(error = %create_err, "Failed to recreate consumer group");
                    }
                    self.config.idle_wait
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        2u64.pow(consecutive_errors.min(5)).min(MAX_ERROR_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Redis read failed, backing off"
                    );
                    Duration::from_secs(backoff_secs)
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(topic = %topic, consumer = %consumer, "Shutdown sender dropped, stopping worker");
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!(topic = %topic, consumer = %consumer, "Worker loop stopped");
    }

    async fn run_batch(
        &self,
        topic: &str,
        consumer: &str,
        handler: &dyn BatchHandler<T>,
        entries: StreamEntries,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let metrics = QueueMetrics::new(BACKEND, topic);
        let (decoded, undecodable) = decode_entries(entries);

        for (entry_id, raw) in undecodable {
            error!(topic = %topic, entry_id = %entry_id, "Undecodable entry, moving to DLQ");
            if let Err(e) = self.dead_letters.record_raw(&raw, "undecodable message").await {
                error!(entry_id = %entry_id, error = %e, "Failed to record undecodable entry");
                continue;
            }
            if let Err(e) = self.remove(topic, &[entry_id]).await {
                error!(error = %e, "Failed to remove undecodable entry");
            }
        }

        if decoded.is_empty() {
            return;
        }

        let size = decoded.len();
        let started = Instant::now();
        let batch: Vec<Message<T>> = decoded.iter().map(|e| e.message.clone()).collect();

        debug!(
            topic = %topic,
            consumer = %consumer,
            batch_size = size,
            handler = handler.name(),
            "Dispatching batch"
        );

        let outcome = AssertUnwindSafe(handler.handle(batch)).catch_unwind().await;
        let reason = match outcome {
            Ok(Ok(())) => {
                metrics.batch_handled(BatchStatus::Success, size, started.elapsed());
                let ids: Vec<String> = decoded.into_iter().map(|e| e.entry_id).collect();
                if let Err(e) = self.remove(topic, &ids).await {
                    error!(topic = %topic, error = %e, "Failed to ACK batch");
                }
                return;
            }
            Ok(Err(e)) => e.failure_reason(),
            Err(_) => "handler panicked".to_string(),
        };

        metrics.batch_handled(BatchStatus::Failed, size, started.elapsed());
        warn!(
            topic = %topic,
            consumer = %consumer,
            batch_size = size,
            handler = handler.name(),
            reason = %reason,
            "Batch failed"
        );

        self.settle_failed_batch(topic, decoded, &reason, shutdown).await;
    }

    /// Dead-letter exhausted entries, requeue the rest after backoff, then retire the originals.
    async fn settle_failed_batch(
        &self,
        topic: &str,
        entries: Vec<StreamEntry<T>>,
        reason: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let metrics = QueueMetrics::new(BACKEND, topic);
        let policy = self.config.retry;
        let mut retry = Vec::with_capacity(entries.len());
        let mut settled = Vec::with_capacity(entries.len());

        for StreamEntry {
            entry_id,
            mut message,
        } in entries
        {
            let attempt = message.bump_attempt();
            if !policy.is_exhausted(attempt) {
                metrics.message_retried(attempt);
                retry.push((entry_id, message));
                continue;
            }

            metrics.message_dead_lettered();
            warn!(
                topic = %topic,
                message_id = %message.id,
                attempt,
                max_attempts = policy.max_attempts,
                "Message exhausted retries, moving to DLQ"
            );
            if let Err(e) = self.dead_letters.record(&message, reason).await {
                // Left pending; the owning worker re-reads it after claim_idle
                error!(message_id = %message.id, error = %e, "Failed to record dead letter");
                continue;
            }
            if let Some(sink) = self.dlq_sink() {
                sink.dead_letter(&message, reason).await;
            }
            settled.push(entry_id);
        }

        if let Some(delay) = retry.iter().map(|(_, m)| policy.backoff(m.attempt)).max() {
            info!(
                topic = %topic,
                count = retry.len(),
                delay_ms = %delay.as_millis(),
                "Scheduling batch retry with backoff"
            );

            if !*shutdown.borrow() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        info!(topic = %topic, "Shutdown during backoff, requeueing immediately");
                    }
                }
            }

            for (entry_id, mut message) in retry {
                match self.entry_exists(topic, &entry_id).await {
                    Ok(false) => {
                        debug!(message_id = %message.id, "Entry removed during backoff, dropping retry");
                        continue;
                    }
                    Ok(true) => {}
                    Err(e) => warn!(entry_id = %entry_id, error = %e, "Failed to check entry before requeue"),
                }

                message.stamp();
                match self.append(topic, &message).await {
                    Ok(_) => settled.push(entry_id),
                    Err(e) => error!(
                        message_id = %message.id,
                        error = %e,
                        "Failed to requeue message"
                    ),
                }
            }
        }

        if let Err(e) = self.remove(topic, &settled).await {
            error!(topic = %topic, error = %e, "Failed to ACK settled entries");
        }
    }
}

/// Split raw stream entries into decoded messages and undecodable payloads
fn decode_entries<T: DeserializeOwned>(
    entries: StreamEntries,
) -> (Vec<StreamEntry<T>>, Vec<(String, String)>) {
    let mut decoded = Vec::with_capacity(entries.len());
    let mut undecodable = Vec::new();

    for (entry_id, fields) in entries {
        let raw = fields
            .into_iter()
            .find(|(k, _)| k == MESSAGE_FIELD)
            .map(|(_, v)| v)
            .unwrap_or_default();

        match serde_json::from_str::<Message<T>>(&raw) {
            Ok(message) => decoded.push(StreamEntry { entry_id, message }),
            Err(_) => undecodable.push((entry_id, raw)),
        }
    }

    (decoded, undecodable)
}

#[async_trait]
impl<T> Publisher<T> for RedisQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn publish(
        &self,
        topic: &str,
        mut message: Message<T>,
    ) -> Result<PublishReceipt, QueueError> {
        if topic.is_empty() {
            return Err(QueueError::InvalidArgument("topic must not be empty".to_string()));
        }

        message.stamp();
        let entry_id = self.append(topic, &message).await?;
        QueueMetrics::new(BACKEND, topic).message_published();

        debug!(
            topic = %topic,
            message_id = %message.id,
            entry_id = %entry_id,
            "Published message"
        );

        Ok(PublishReceipt {
            topic: topic.to_string(),
            message_id: message.id,
        })
    }
}

#[async_trait]
impl<T> Consumer<T> for RedisQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn BatchHandler<T>>,
        options: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        if topic.is_empty() {
            return Err(QueueError::InvalidArgument("topic must not be empty".to_string()));
        }

        let stream = self.config.topic_stream(topic);
        self.ensure_group(&stream).await?;
        let mut conn = self.redis.clone();
        let _: () = conn.sadd(self.config.topics_key(), topic).await?;

        let max_batch = options.max_batch.max(1);
        let max_concurrent = options.max_concurrent.max(1);

        info!(
            topic = %topic,
            stream = %stream,
            group = %self.config.consumer_group,
            consumer_id = %self.config.consumer_id,
            handler = handler.name(),
            max_batch,
            max_concurrent,
            "Starting Redis consumer"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..max_concurrent {
            workers.spawn(self.clone().worker_loop(
                worker_id,
                topic.to_string(),
                Arc::clone(&handler),
                max_batch,
                shutdown.clone(),
            ));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(topic = %topic, error = %e, "Worker task failed");
            }
        }

        info!(topic = %topic, "Redis consumer stopped");
        Ok(())
    }

    fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<T>>) {
        *self
            .dlq
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }
}
