//! Prometheus metrics for queue engines
//!
//! Provides observability into publish rates, batch outcomes, retries and
//! dead letters. Recording is a no-op until a recorder is installed.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .map(|handle| {
                info!("Prometheus metrics initialized");
                handle
            })
            .map_err(|e| {
                warn!(error = %e, "Failed to install Prometheus recorder");
                e
            })
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Batch outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Success,
    Failed,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Per-topic metrics helper
#[derive(Clone)]
pub struct QueueMetrics {
    /// Backend name for labeling ("memory" or "redis")
    backend: &'static str,
    /// Topic name for labeling
    topic: String,
}

impl QueueMetrics {
    pub fn new(backend: &'static str, topic: impl Into<String>) -> Self {
        Self {
            backend,
            topic: topic.into(),
        }
    }

    /// Record a message being published
    pub fn message_published(&self) {
        counter!(
            "event_queue_messages_published_total",
            "backend" => self.backend,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record a handled batch
    pub fn batch_handled(&self, status: BatchStatus, size: usize, duration: Duration) {
        counter!(
            "event_queue_batches_total",
            "backend" => self.backend,
            "topic" => self.topic.clone(),
            "status" => status.as_str()
        )
        .increment(1);

        counter!(
            "event_queue_messages_handled_total",
            "backend" => self.backend,
            "topic" => self.topic.clone(),
            "status" => status.as_str()
        )
        .increment(size as u64);

        histogram!(
            "event_queue_batch_duration_seconds",
            "backend" => self.backend,
            "topic" => self.topic.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message scheduled for redelivery
    pub fn message_retried(&self, attempt: u32) {
        counter!(
            "event_queue_retries_total",
            "backend" => self.backend,
            "topic" => self.topic.clone(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a message moved to the DLQ
    pub fn message_dead_lettered(&self) {
        counter!(
            "event_queue_dead_letters_total",
            "backend" => self.backend,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Update topic depth gauge
    pub fn topic_depth(&self, depth: usize) {
        gauge!(
            "event_queue_topic_depth",
            "backend" => self.backend,
            "topic" => self.topic.clone()
        )
        .set(depth as f64);
    }
}
