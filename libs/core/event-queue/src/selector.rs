//! Startup-time choice between the in-process and durable drivers.

use crate::config::EngineConfig;
use crate::driver::DriverKind;
use crate::error::QueueError;
use crate::facade::JobQueue;
use crate::redis_queue::connect;
use core_config::queue::QueueSettings;
use tracing::{info, warn};

impl DriverKind {
    /// Durable only when the flag is set and a Redis URL is configured.
    pub fn select(settings: &QueueSettings) -> Self {
        if settings.wants_redis() {
            DriverKind::Redis
        } else {
            DriverKind::Memory
        }
    }
}

/// Build the job queue for the configured driver.
///
/// A Redis backend that cannot be reached fails startup with
/// `BackendUnavailable`; there is no silent fallback once Redis was chosen.
pub async fn build_job_queue(settings: &QueueSettings) -> Result<JobQueue, QueueError> {
    let config = EngineConfig::from_settings(settings);

    match (DriverKind::select(settings), settings.redis_url.as_deref()) {
        (DriverKind::Redis, Some(url)) => {
            let redis = connect(url).await?;
            info!(
                driver = %DriverKind::Redis,
                key_prefix = %config.key_prefix,
                consumer_group = %config.consumer_group,
                "Using durable queue driver"
            );
            Ok(JobQueue::redis(redis, config))
        }
        _ => {
            if settings.use_redis {
                warn!("QUEUE_USE_REDIS is set but no Redis URL is configured, using in-memory queue");
            }
            info!(driver = %DriverKind::Memory, "Using in-memory queue driver");
            Ok(JobQueue::in_memory(config))
        }
    }
}
