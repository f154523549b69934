//! In-process queue engine.
//!
//! Topic buffers live in an owned, mutex-guarded map shared by clones of the
//! same `MemoryQueue`. Each `consume` call runs `max_concurrent` worker loops
//! that drain FIFO batches, hand them to the handler and apply the retry
//! policy when the handler fails:
//!
//! ```text
//! published -> in-batch -> success: discarded
//!                       -> failure: attempt += 1
//!                            attempt >= budget: DLQ (terminal)
//!                            otherwise: backoff, republish -> in-batch ...
//! ```
//!
//! Nothing is persisted and pending buffers are unbounded. Retries go to the
//! tail of their topic, so per-key order only holds until a message fails.
//! `clear` bumps a generation counter; retries from batches taken before the
//! clear are dropped instead of requeued.

use crate::config::{ConsumeOptions, EngineConfig};
use crate::contract::{BatchHandler, Consumer, DeadLetterSink, PublishReceipt, Publisher};
use crate::error::QueueError;
use crate::message::Message;
use crate::metrics::{BatchStatus, QueueMetrics};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const BACKEND: &str = "memory";

type Topics<T> = HashMap<String, VecDeque<Message<T>>>;
type SinkSlot<T> = Arc<RwLock<Option<Arc<dyn DeadLetterSink<T>>>>>;

/// In-process queue engine.
///
/// Cloning is cheap and every clone shares the same topics and DLQ sink.
pub struct MemoryQueue<T> {
    topics: Arc<Mutex<Topics<T>>>,
    generation: Arc<AtomicU64>,
    dlq: SinkSlot<T>,
    config: EngineConfig,
}

impl<T> Clone for MemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
            generation: Arc::clone(&self.generation),
            dlq: Arc::clone(&self.dlq),
            config: self.config.clone(),
        }
    }
}

impl<T> Default for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an engine with default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with explicit configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            dlq: Arc::new(RwLock::new(None)),
            config,
        }
    }

    /// Get the engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of a topic's pending messages in delivery order
    pub async fn pending(&self, topic: &str) -> Vec<Message<T>> {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of pending messages on a topic
    pub async fn depth(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics.get(topic).map(VecDeque::len).unwrap_or(0)
    }

    /// Topics that currently hold pending messages
    pub async fn topics(&self) -> Vec<String> {
        let topics = self.topics.lock().await;
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Keep only pending messages matching `keep`, returning how many were removed
    pub async fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str, &Message<T>) -> bool,
    {
        let mut topics = self.topics.lock().await;
        let mut removed = 0;
        for (topic, queue) in topics.iter_mut() {
            let before = queue.len();
            queue.retain(|message| keep(topic, message));
            removed += before - queue.len();
        }
        topics.retain(|_, queue| !queue.is_empty());
        removed
    }

    /// Drop every pending message on every topic
    pub async fn clear(&self) -> usize {
        let mut topics = self.topics.lock().await;
        let removed = topics.values().map(VecDeque::len).sum();
        topics.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(removed, "Cleared in-process queue");
        removed
    }

    async fn append(&self, topic: &str, messages: Vec<Message<T>>) {
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic.to_string()).or_default();
        queue.extend(messages);
        QueueMetrics::new(BACKEND, topic).topic_depth(queue.len());
    }

    /// Put retries back on a topic unless the queue was cleared since `generation`
    async fn requeue(&self, topic: &str, messages: Vec<Message<T>>, generation: u64) {
        let mut topics = self.topics.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(topic = %topic, count = messages.len(), "Queue cleared during backoff, dropping retries");
            return;
        }
        let queue = topics.entry(topic.to_string()).or_default();
        queue.extend(messages);
        QueueMetrics::new(BACKEND, topic).topic_depth(queue.len());
    }

    /// Take up to `max_batch` messages along with the current clear generation
    async fn take_batch(&self, topic: &str, max_batch: usize) -> (Vec<Message<T>>, u64) {
        let mut topics = self.topics.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(queue) = topics.get_mut(topic) else {
            return (Vec::new(), generation);
        };
        let count = max_batch.min(queue.len());
        let batch: Vec<Message<T>> = queue.drain(..count).collect();
        QueueMetrics::new(BACKEND, topic).topic_depth(queue.len());
        (batch, generation)
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
        debug!(topic = %topic, worker_id, "Worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (batch, generation) = self.take_batch(&topic, max_batch).await;
            if batch.is_empty() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            debug!(topic = %topic, worker_id, "Shutdown sender dropped, stopping worker");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.idle_wait) => {}
                }
                continue;
            }

            self.run_batch(&topic, worker_id, handler.as_ref(), batch, generation, &mut shutdown)
                .await;
        }

        debug!(topic = %topic, worker_id, "Worker loop stopped");
    }

    async fn run_batch(
        &self,
        topic: &str,
        worker_id: usize,
        handler: &dyn BatchHandler<T>,
        batch: Vec<Message<T>>,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let metrics = QueueMetrics::new(BACKEND, topic);
        let size = batch.len();
        let started = Instant::now();

        debug!(
            topic = %topic,
            worker_id,
            batch_size = size,
            handler = handler.name(),
            "Dispatching batch"
        );

        let outcome = AssertUnwindSafe(handler.handle(batch.clone()))
            .catch_unwind()
            .await;

        let reason = match outcome {
            Ok(Ok(())) => {
                metrics.batch_handled(BatchStatus::Success, size, started.elapsed());
                return;
            }
            Ok(Err(e)) => e.failure_reason(),
            Err(_) => "handler panicked".to_string(),
        };

        metrics.batch_handled(BatchStatus::Failed, size, started.elapsed());
        warn!(
            topic = %topic,
            worker_id,
            batch_size = size,
            handler = handler.name(),
            reason = %reason,
            "Batch failed"
        );

        self.settle_failed_batch(topic, batch, &reason, generation, shutdown)
            .await;
    }

    /// Bump attempts, dead-letter exhausted messages and requeue the rest after backoff.
    async fn settle_failed_batch(
        &self,
        topic: &str,
        batch: Vec<Message<T>>,
        reason: &str,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let metrics = QueueMetrics::new(BACKEND, topic);
        let policy = self.config.retry;
        let mut retry = Vec::with_capacity(batch.len());

        for mut message in batch {
            let attempt = message.bump_attempt();
            if policy.is_exhausted(attempt) {
                metrics.message_dead_lettered();
                warn!(
                    topic = %topic,
                    message_id = %message.id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Message exhausted retries, moving to DLQ"
                );
                match self.dlq_sink() {
                    Some(sink) => sink.dead_letter(&message, reason).await,
                    None => error!(
                        topic = %topic,
                        message_id = %message.id,
                        "No DLQ sink registered, dropping message"
                    ),
                }
            } else {
                metrics.message_retried(attempt);
                retry.push(message);
            }
        }

        let Some(delay) = retry.iter().map(|m| policy.backoff(m.attempt)).max() else {
            return;
        };

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

        for message in retry.iter_mut() {
            message.stamp();
        }
        self.requeue(topic, retry, generation).await;
    }
}

#[async_trait]
impl<T> Publisher<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
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
        let receipt = PublishReceipt {
            topic: topic.to_string(),
            message_id: message.id.clone(),
        };

        debug!(topic = %topic, message_id = %message.id, key = %message.key, "Published message");
        self.append(topic, vec![message]).await;
        QueueMetrics::new(BACKEND, topic).message_published();

        Ok(receipt)
    }
}

#[async_trait]
impl<T> Consumer<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
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

        let max_batch = options.max_batch.max(1);
        let max_concurrent = options.max_concurrent.max(1);

        info!(
            topic = %topic,
            handler = handler.name(),
            max_batch,
            max_concurrent,
            idle_wait_ms = %self.config.idle_wait.as_millis(),
            "Starting in-process consumer"
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

        info!(topic = %topic, "In-process consumer stopped");
        Ok(())
    }

    fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<T>>) {
        *self
            .dlq
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }
}
