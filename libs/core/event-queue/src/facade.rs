//! Webhook job queue facade.
//!
//! The single entry point the ingestion path talks to. It validates input,
//! delegates to the selected driver, and hides which backend is active.
//!
//! # Example
//!
//! ```ignore
//! use event_queue::{EngineConfig, JobQueue, NewJob};
//! use serde_json::json;
//!
//! let queue = JobQueue::in_memory(EngineConfig::default());
//! let job = queue
//!     .enqueue_webhook_job(NewJob::new("orders/create", "shop.myshopify.com", json!({"id": 1})))
//!     .await?;
//! assert_eq!(queue.snapshot_queue().await?.len(), 1);
//! ```

use crate::config::{ConsumeOptions, EngineConfig};
use crate::contract::DeadLetterSink;
use crate::driver::{DriverKind, JobHandler, MemoryDriver, QueueDriver, RedisDriver};
use crate::error::QueueError;
use crate::job::{Job, JobStatus, NewJob};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Job queue over whichever driver was selected at startup
#[derive(Clone)]
pub struct JobQueue {
    driver: Arc<dyn QueueDriver>,
}

impl JobQueue {
    pub fn new(driver: Arc<dyn QueueDriver>) -> Self {
        Self { driver }
    }

    /// Queue backed by the in-process engine
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(MemoryDriver::new(config)))
    }

    /// Queue backed by Redis Streams
    pub fn redis(redis: ConnectionManager, config: EngineConfig) -> Self {
        Self::new(Arc::new(RedisDriver::new(redis, config)))
    }

    pub fn driver_kind(&self) -> DriverKind {
        self.driver.kind()
    }

    /// Whether jobs survive a process restart
    pub fn is_durable_backend_enabled(&self) -> bool {
        self.driver.kind().is_durable()
    }

    /// Accept a webhook and queue it as a pending job.
    #[instrument(skip(self, new_job), fields(topic_key = %new_job.topic_key, shop_domain = %new_job.shop_domain))]
    pub async fn enqueue_webhook_job(&self, new_job: NewJob) -> Result<Job, QueueError> {
        if new_job.topic_key.trim().is_empty() {
            return Err(QueueError::InvalidArgument("topic_key must not be empty".to_string()));
        }
        if new_job.shop_domain.trim().is_empty() {
            return Err(QueueError::InvalidArgument("shop_domain must not be empty".to_string()));
        }

        let job = self.driver.enqueue(Job::pending(new_job)).await?;
        debug!(job_id = %job.id, driver = %self.driver.kind(), "Enqueued webhook job");
        Ok(job)
    }

    /// Every non-terminal job, oldest first
    pub async fn snapshot_queue(&self) -> Result<Vec<Job>, QueueError> {
        self.driver.snapshot().await
    }

    /// Look up a job by ID
    pub async fn job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.driver.get(id).await
    }

    /// Overwrite a job's status.
    ///
    /// Marking a job `failed` records `error` and counts an attempt. The
    /// durable driver rejects this with `UnsupportedOperation`.
    pub async fn mark_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, QueueError> {
        self.driver.mark_status(id, status, error).await
    }

    /// Drop every outstanding job for a shop (case-insensitive match)
    #[instrument(skip(self))]
    pub async fn purge_shop_jobs(&self, shop_domain: &str) -> Result<usize, QueueError> {
        if shop_domain.trim().is_empty() {
            return Err(QueueError::InvalidArgument("shop_domain must not be empty".to_string()));
        }
        self.driver.purge_shop(shop_domain).await
    }

    /// Drop every job on every topic
    pub async fn clear_queue(&self) -> Result<usize, QueueError> {
        let removed = self.driver.clear().await?;
        info!(removed, driver = %self.driver.kind(), "Cleared job queue");
        Ok(removed)
    }

    /// Run workers for a topic until `shutdown` flips to true
    pub async fn consume(
        &self,
        topic_key: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        self.driver.consume(topic_key, handler, options, shutdown).await
    }

    /// Register where exhausted jobs go
    pub fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<Job>>) {
        self.driver.set_dlq(sink);
    }

    /// Check the backend is reachable
    pub async fn ping(&self) -> Result<(), QueueError> {
        self.driver.ping().await
    }
}
