//! Publisher/consumer contract
//!
//! The narrow interface the rest of the system depends on, independent of
//! which backend stores the messages.
//!
//! # Example
//!
//! ```rust,ignore
//! use event_queue::{handler_fn, ConsumeOptions, Consumer, MemoryQueue, Message, Publisher};
//!
//! let queue = MemoryQueue::new();
//! queue.publish("orders", Message::new("shop-a", json!({"n": 1}))).await?;
//!
//! let handler = handler_fn(|batch: Vec<Message<Value>>| async move {
//!     for message in &batch {
//!         println!("{} -> {}", message.key, message.payload);
//!     }
//!     Ok(())
//! });
//!
//! // Runs until `shutdown_tx.send(true)`
//! queue.consume("orders", handler, ConsumeOptions::default(), shutdown_rx).await?;
//! ```

use crate::config::ConsumeOptions;
use crate::error::QueueError;
use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Acknowledgement that a message was accepted by the backend.
///
/// On the in-process backend acceptance is not durability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Topic the message was appended to
    pub topic: String,
    /// Assigned message ID
    pub message_id: String,
}

/// Publishes messages onto named topics.
#[async_trait]
pub trait Publisher<T: Send + Sync + 'static>: Send + Sync {
    /// Append one message to a topic.
    async fn publish(&self, topic: &str, message: Message<T>) -> Result<PublishReceipt, QueueError>;
}

/// Drains topics through a batch handler.
#[async_trait]
pub trait Consumer<T: Send + Sync + 'static>: Send + Sync {
    /// Run `options.max_concurrent` worker loops over `topic` until `shutdown` is set.
    ///
    /// Handler failures are never returned here; they are retried with
    /// backoff or dead-lettered.
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn BatchHandler<T>>,
        options: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError>;

    /// Register the dead letter sink, replacing any previous one.
    fn set_dlq(&self, sink: Arc<dyn DeadLetterSink<T>>);
}

/// Processes a batch of messages.
///
/// Returning `Err` fails the whole batch: every message in it is retried.
/// Handlers wanting per-item retry should swallow item errors themselves.
#[async_trait]
pub trait BatchHandler<T: Send + Sync + 'static>: Send + Sync {
    async fn handle(&self, batch: Vec<Message<T>>) -> Result<(), QueueError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str {
        "batch_handler"
    }
}

/// Terminal sink for messages that exhausted their retry budget.
#[async_trait]
pub trait DeadLetterSink<T: Send + Sync + 'static>: Send + Sync {
    /// Called exactly once per permanently failed message.
    async fn dead_letter(&self, message: &Message<T>, reason: &str);
}

/// Batch handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for FnHandler<F>
where
    T: Send + Sync + 'static,
    F: Fn(Vec<Message<T>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn handle(&self, batch: Vec<Message<T>>) -> Result<(), QueueError> {
        (self.f)(batch).await
    }

    fn name(&self) -> &'static str {
        "fn_handler"
    }
}

/// Wrap an async closure as a shareable batch handler.
pub fn handler_fn<T, F, Fut>(f: F) -> Arc<dyn BatchHandler<T>>
where
    T: Send + Sync + 'static,
    F: Fn(Vec<Message<T>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
