//! In-process job driver.
//!
//! Owns the authoritative job registry and mirrors each job as a
//! `Message<Job>` on the in-process engine. The registry keeps terminal jobs
//! until they are purged or cleared.

use super::{sort_jobs, DriverKind, JobHandler, QueueDriver};
use crate::config::{ConsumeOptions, EngineConfig};
use crate::contract::{BatchHandler, Consumer, DeadLetterSink, Publisher};
use crate::error::QueueError;
use crate::job::{Job, JobStatus};
use crate::memory::MemoryQueue;
use crate::message::Message;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

type Registry = Arc<Mutex<HashMap<String, Job>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, Job>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Job driver over the in-process engine
#[derive(Clone)]
pub struct MemoryDriver {
    engine: MemoryQueue<Job>,
    jobs: Registry,
}

impl MemoryDriver {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            engine: MemoryQueue::with_config(config),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying message engine
    pub fn engine(&self) -> &MemoryQueue<Job> {
        &self.engine
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    async fn enqueue(&self, job: Job) -> Result<Job, QueueError> {
        lock(&self.jobs).insert(job.id.clone(), job.clone());

        let message = Message::new(job.partition_key(), job.clone()).with_id(job.id.clone());
        if let Err(e) = self.engine.publish(&job.topic_key, message).await {
            lock(&self.jobs).remove(&job.id);
            return Err(e);
        }

        Ok(job)
    }

    async fn snapshot(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect();
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(lock(&self.jobs).get(id).cloned())
    }

    async fn mark_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, QueueError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        job.status = status;
        if status == JobStatus::Failed {
            job.attempts = job.attempts.saturating_add(1);
        }
        if error.is_some() {
            job.error = error;
        }

        debug!(job_id = %id, status = %status, attempts = job.attempts, "Marked job status");
        Ok(job.clone())
    }

    async fn purge_shop(&self, shop_domain: &str) -> Result<usize, QueueError> {
        // Terminal records stay addressable by id
        let ids: HashSet<String> = {
            let mut jobs = lock(&self.jobs);
            let ids: HashSet<String> = jobs
                .values()
                .filter(|job| job.belongs_to(shop_domain) && !job.status.is_terminal())
                .map(|job| job.id.clone())
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };
        let purged = ids.len();

        let dropped = self.engine.retain(|_, message| !ids.contains(&message.id)).await;
        info!(shop_domain = %shop_domain, purged, dropped_messages = dropped, "Purged shop jobs");
        Ok(purged)
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let removed = {
            let mut jobs = lock(&self.jobs);
            let count = jobs.len();
            jobs.clear();
            count
        };
        self.engine.clear().await;
        Ok(removed)
    }

    async fn consume(
        &self,
        topic_key: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let adapter = TrackedJobs {
            jobs: Arc::clone(&self.jobs),
            inner: handler,
            retry: self.engine.config().retry,
        };
        self.engine
            .consume(topic_key, Arc::new(adapter), options, shutdown)
            .await
    }

    fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<Job>>) {
        self.engine.set_dlq(sink);
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Drives registry transitions around the application's job handler.
struct TrackedJobs {
    jobs: Registry,
    inner: Arc<dyn JobHandler>,
    retry: RetryPolicy,
}

#[async_trait]
impl BatchHandler<Job> for TrackedJobs {
    async fn handle(&self, batch: Vec<Message<Job>>) -> Result<(), QueueError> {
        let claimed: Vec<Job> = {
            let mut jobs = lock(&self.jobs);
            batch
                .iter()
                .filter_map(|message| {
                    let job = jobs.get_mut(&message.id)?;
                    if job.status.is_terminal() {
                        return None;
                    }
                    job.status = JobStatus::Processing;
                    job.attempts = message.attempt;
                    Some(job.clone())
                })
                .collect()
        };

        if claimed.is_empty() {
            debug!(batch_size = batch.len(), "Skipping batch of purged or settled jobs");
            return Ok(());
        }

        let ids: Vec<String> = claimed.iter().map(|job| job.id.clone()).collect();
        let outcome = AssertUnwindSafe(self.inner.handle(claimed))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(QueueError::handler("handler panicked")));

        let mut jobs = lock(&self.jobs);
        match outcome {
            Ok(()) => {
                for id in &ids {
                    if let Some(job) = jobs.get_mut(id)
                        && job.status == JobStatus::Processing
                    {
                        job.status = JobStatus::Completed;
                    }
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.failure_reason();
                for id in &ids {
                    if let Some(job) = jobs.get_mut(id)
                        && job.status == JobStatus::Processing
                    {
                        job.attempts = job.attempts.saturating_add(1);
                        job.error = Some(reason.clone());
                        job.status = if self.retry.is_exhausted(job.attempts) {
                            JobStatus::Failed
                        } else {
                            JobStatus::Pending
                        };
                    }
                }
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
