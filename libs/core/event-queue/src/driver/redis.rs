//! Durable job driver.
//!
//! The broker is the only source of truth: a job exists while its stream
//! entry exists, and is `processing` while that entry sits in the consumer
//! group's pending list. Status cannot be overwritten from outside.

use super::{sort_jobs, DriverKind, JobHandler, QueueDriver};
use crate::config::{ConsumeOptions, EngineConfig};
use crate::contract::{BatchHandler, Consumer, DeadLetterSink, Publisher};
use crate::error::QueueError;
use crate::job::{Job, JobStatus};
use crate::message::Message;
use crate::redis_queue::{RedisQueue, StreamEntry};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Job driver over Redis Streams
#[derive(Clone)]
pub struct RedisDriver {
    queue: RedisQueue<Job>,
}

impl RedisDriver {
    pub fn new(redis: ConnectionManager, config: EngineConfig) -> Self {
        Self {
            queue: RedisQueue::new(redis, config),
        }
    }

    /// The underlying stream engine
    pub fn queue(&self) -> &RedisQueue<Job> {
        &self.queue
    }
}

fn job_from_entry(entry: StreamEntry<Job>, in_flight: &HashSet<String>) -> Job {
    let mut job = entry.message.payload;
    job.attempts = entry.message.attempt;
    job.status = if in_flight.contains(&entry.entry_id) {
        JobStatus::Processing
    } else {
        JobStatus::Pending
    };
    job
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Redis
    }

    async fn enqueue(&self, job: Job) -> Result<Job, QueueError> {
        let message = Message::new(job.partition_key(), job.clone()).with_id(job.id.clone());
        self.queue.publish(&job.topic_key, message).await?;
        Ok(job)
    }

    async fn snapshot(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::new();
        for topic in self.queue.topics().await? {
            let in_flight = self.queue.in_flight(&topic).await?;
            jobs.extend(
                self.queue
                    .list(&topic)
                    .await?
                    .into_iter()
                    .map(|entry| job_from_entry(entry, &in_flight)),
            );
        }
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.snapshot().await?.into_iter().find(|job| job.id == id))
    }

    async fn mark_status(
        &self,
        _id: &str,
        _status: JobStatus,
        _error: Option<String>,
    ) -> Result<Job, QueueError> {
        Err(QueueError::unsupported("mark_job_status", "redis"))
    }

    async fn purge_shop(&self, shop_domain: &str) -> Result<usize, QueueError> {
        let mut purged = 0;
        for topic in self.queue.topics().await? {
            let entry_ids: Vec<String> = self
                .queue
                .list(&topic)
                .await?
                .into_iter()
                .filter(|entry| entry.message.payload.belongs_to(shop_domain))
                .map(|entry| entry.entry_id)
                .collect();
            purged += self.queue.remove(&topic, &entry_ids).await?;
        }

        info!(shop_domain = %shop_domain, purged, "Purged shop jobs");
        Ok(purged)
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let mut removed = 0;
        for topic in self.queue.topics().await? {
            removed += self.queue.drain(&topic).await?;
        }
        Ok(removed)
    }

    async fn consume(
        &self,
        topic_key: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        self.queue
            .consume(topic_key, Arc::new(ClaimedJobs { inner: handler }), options, shutdown)
            .await
    }

    fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<Job>>) {
        self.queue.set_dlq(sink);
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.queue.ping().await
    }
}

/// Presents delivered messages to the job handler as claimed jobs.
struct ClaimedJobs {
    inner: Arc<dyn JobHandler>,
}

#[async_trait]
impl BatchHandler<Job> for ClaimedJobs {
    async fn handle(&self, batch: Vec<Message<Job>>) -> Result<(), QueueError> {
        let jobs = batch
            .into_iter()
            .map(|message| {
                let mut job = message.payload;
                job.status = JobStatus::Processing;
                job.attempts = message.attempt;
                job
            })
            .collect();
        self.inner.handle(jobs).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
