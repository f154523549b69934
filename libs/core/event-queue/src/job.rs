//! Webhook job model.
//!
//! A `Job` is the business-facing record wrapping a message on the ingestion
//! path. It travels as the payload of a `Message<Job>` whose key is the
//! job's shop domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker as part of a batch.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Retry budget exhausted; dead-lettered.
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Input for enqueueing a webhook job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    /// Logical event type (e.g., "orders/create")
    pub topic_key: String,
    /// Tenant the event belongs to
    pub shop_domain: String,
    /// Raw webhook body
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(
        topic_key: impl Into<String>,
        shop_domain: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic_key: topic_key.into(),
            shop_domain: shop_domain.into(),
            payload,
        }
    }
}

/// A tracked webhook job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub topic_key: String,
    pub shop_domain: String,
    pub payload: serde_json::Value,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

fn default_status() -> JobStatus {
    JobStatus::Pending
}

impl Job {
    /// Create a pending job with a fresh ID
    pub fn pending(new_job: NewJob) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            topic_key: new_job.topic_key,
            shop_domain: new_job.shop_domain,
            payload: new_job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            error: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Tenant match used by purges and filters
    pub fn belongs_to(&self, shop_domain: &str) -> bool {
        self.shop_domain.eq_ignore_ascii_case(shop_domain)
    }

    /// Partition key for this job's message
    pub fn partition_key(&self) -> String {
        self.shop_domain.to_ascii_lowercase()
    }
}
