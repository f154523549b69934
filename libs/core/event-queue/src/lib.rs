//! Event Queue
//!
//! Asynchronous delivery of webhook events with batching, retry and dead
//! lettering, behind one publisher/consumer contract.
//!
//! ## Features
//!
//! - **Envelope**: `Message<T>` with partition key, attempt counter and timestamp
//! - **In-process engine**: `MemoryQueue<T>` with FIFO topics and worker loops
//! - **Durable engine**: `RedisQueue<T>` on Redis Streams with consumer groups
//! - **Retry policy**: exponential backoff with a ceiling and a 5-attempt budget
//! - **Dead letters**: pluggable `DeadLetterSink`, plus a Redis DLQ stream
//! - **Job facade**: `JobQueue` for webhook ingestion over either driver
//! - **Admin endpoints**: health, readiness, queue snapshot, tenant purge, metrics
//!
//! ## Example
//!
//! ```ignore
//! use event_queue::{build_job_queue, job_handler_fn, ConsumeOptions, NewJob};
//!
//! let queue = build_job_queue(&QueueSettings::from_env()?).await?;
//! queue
//!     .enqueue_webhook_job(NewJob::new("orders/create", "shop.myshopify.com", payload))
//!     .await?;
//!
//! let handler = job_handler_fn(|jobs| async move {
//!     for job in &jobs {
//!         tracing::info!(job_id = %job.id, "processing");
//!     }
//!     Ok(())
//! });
//! queue
//!     .consume("orders/create", handler, ConsumeOptions::default(), shutdown_rx)
//!     .await?;
//! ```

mod config;
mod contract;
mod dlq;
mod driver;
mod error;
mod facade;
mod health;
mod job;
mod memory;
mod message;
pub mod metrics;
mod redis_queue;
mod retry;
mod selector;

// Re-export main types
pub use config::{ConsumeOptions, EngineConfig};
pub use contract::{handler_fn, BatchHandler, Consumer, DeadLetterSink, FnHandler, PublishReceipt, Publisher};
pub use dlq::{DeadLetter, DlqStats, InMemoryDeadLetters, RedisDeadLetters};
pub use driver::{job_handler_fn, DriverKind, FnJobHandler, JobHandler, MemoryDriver, QueueDriver, RedisDriver};
pub use error::QueueError;
pub use facade::JobQueue;
pub use health::{admin_router, HealthResponse, HealthState};
pub use job::{Job, JobStatus, NewJob};
pub use memory::MemoryQueue;
pub use message::Message;
pub use metrics::{init_metrics, QueueMetrics};
pub use redis_queue::{connect, RedisQueue, StreamEntry};
pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use selector::build_job_queue;
pub use core_config::queue::QueueSettings;
