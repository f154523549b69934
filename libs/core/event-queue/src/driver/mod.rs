//! Queue drivers behind the job facade.
//!
//! A `QueueDriver` binds the facade's operations to one backend:
//! - `MemoryDriver`: in-process engine plus a job registry it owns
//! - `RedisDriver`: Redis Streams engine; the broker owns job state

mod memory;
mod redis;

pub use self::memory::MemoryDriver;
pub use self::redis::RedisDriver;

use crate::config::ConsumeOptions;
use crate::contract::DeadLetterSink;
use crate::error::QueueError;
use crate::job::{Job, JobStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::watch;

/// Which backend a driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// In-process engine.
    Memory,
    /// Durable Redis Streams broker.
    Redis,
}

impl DriverKind {
    pub fn is_durable(&self) -> bool {
        matches!(self, DriverKind::Redis)
    }
}

/// Processes a batch of claimed jobs.
///
/// Returning `Err` fails every job in the batch.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, jobs: Vec<Job>) -> Result<(), QueueError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str {
        "job_handler"
    }
}

/// Backend operations the job facade is built on.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Store a pending job
    async fn enqueue(&self, job: Job) -> Result<Job, QueueError>;

    /// Non-terminal jobs, oldest first
    async fn snapshot(&self) -> Result<Vec<Job>, QueueError>;

    /// Look up one job
    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Overwrite a job's status
    async fn mark_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, QueueError>;

    /// Remove every non-terminal job of a tenant, returning how many were removed
    async fn purge_shop(&self, shop_domain: &str) -> Result<usize, QueueError>;

    /// Remove every job on every topic
    async fn clear(&self) -> Result<usize, QueueError>;

    /// Run workers over one topic until shutdown
    async fn consume(
        &self,
        topic_key: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError>;

    /// Register the dead letter sink for exhausted jobs
    fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<Job>>);

    /// Check the backend is reachable
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Job handler backed by an async closure
pub struct FnJobHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(Vec<Job>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn handle(&self, jobs: Vec<Job>) -> Result<(), QueueError> {
        (self.f)(jobs).await
    }

    fn name(&self) -> &'static str {
        "fn_job_handler"
    }
}

/// Wrap an async closure as a shareable job handler.
pub fn job_handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
{
    Arc::new(FnJobHandler { f })
}

/// Sort jobs oldest first; IDs are time-ordered so they break ties.
pub(crate) fn sort_jobs(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.enqueued_at
            .cmp(&b.enqueued_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
