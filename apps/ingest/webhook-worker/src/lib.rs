//! Webhook Worker Service
//!
//! A background worker that drains webhook jobs from the event queue.
//!
//! ## Architecture
//!
//! ```text
//! enqueue_webhook_job (ingestion API)
//!   ↓
//! JobQueue (in-process or Redis Streams, picked by QUEUE_USE_REDIS)
//!   ↓ (one consumer per topic in WEBHOOK_TOPICS)
//! WebhookProcessor
//!   ↓ (after 5 failed attempts)
//! DeadLetterLog
//! ```
//!
//! ## Features
//!
//! - Batch consumption with retry and exponential backoff
//! - Dead letter logging for exhausted jobs
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Admin endpoint for probes, queue snapshot, tenant purge and metrics

use async_trait::async_trait;
use axum::Router;
use core_config::server::AdminServerConfig;
use core_config::{app_info, env_or_default, Environment, FromEnv};
use event_queue::{
    admin_router, build_job_queue, metrics, ConsumeOptions, DeadLetterSink, HealthState, Job,
    JobHandler, JobQueue, Message, QueueError, QueueSettings,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DEFAULT_TOPICS: &str = "orders/create,orders/updated,app/uninstalled";

/// Topic keys from a comma-separated list, blanks and duplicates dropped
pub fn parse_topics(raw: &str) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for topic in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
    }
    topics
}

/// Handles claimed webhook jobs.
pub struct WebhookProcessor;

#[async_trait]
impl JobHandler for WebhookProcessor {
    async fn handle(&self, jobs: Vec<Job>) -> Result<(), QueueError> {
        for job in &jobs {
            if job.payload.is_null() {
                return Err(QueueError::handler(format!("job {} has an empty payload", job.id)));
            }
            info!(
                job_id = %job.id,
                topic_key = %job.topic_key,
                shop_domain = %job.shop_domain,
                attempts = job.attempts,
                "Processed webhook job"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook_processor"
    }
}

/// Dead letter sink that reports exhausted jobs in the logs.
pub struct DeadLetterLog;

#[async_trait]
impl DeadLetterSink<Job> for DeadLetterLog {
    async fn dead_letter(&self, message: &Message<Job>, reason: &str) {
        error!(
            job_id = %message.payload.id,
            topic_key = %message.payload.topic_key,
            shop_domain = %message.payload.shop_domain,
            attempt = message.attempt,
            reason = %reason,
            "Webhook job dead-lettered"
        );
    }
}

/// Start the admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Queue inspection: `/queue/snapshot`, `/queue/jobs/{id}`
/// - Tenant purge: `DELETE /queue/shops/{shop_domain}`
/// - Prometheus metrics: `/metrics`
async fn start_admin_server(state: HealthState, config: AdminServerConfig) -> Result<()> {
    let app: Router = admin_router(state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", addr))?;

    info!(address = %addr, "Admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Run one consumer per topic until shutdown
async fn consume_topics(
    queue: JobQueue,
    topics: Vec<String>,
    options: ConsumeOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let handler: Arc<dyn JobHandler> = Arc::new(WebhookProcessor);
    let mut consumers = JoinSet::new();

    for topic in topics {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        consumers.spawn(async move {
            let result = queue.consume(&topic, handler, options, shutdown).await;
            (topic, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((topic, Err(e))) => {
                failed += 1;
                error!(topic_key = %topic, error = %e, "Consumer stopped with error");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Consumer task failed");
            }
        }
    }

    if failed > 0 {
        eyre::bail!("{} consumer(s) failed", failed);
    }
    Ok(())
}

/// Run the webhook worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads queue settings and builds the selected driver
/// 3. Starts the admin server
/// 4. Consumes every configured topic with graceful shutdown handling
///
/// # Errors
///
/// Returns an error if:
/// - Queue or admin configuration is invalid
/// - The durable backend was selected but Redis is unreachable
/// - A consumer stops with an error
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting webhook worker service");
    info!("Environment: {:?}", environment);

    let settings = QueueSettings::from_env().wrap_err("Failed to load queue configuration")?;
    let admin_config =
        AdminServerConfig::from_env().wrap_err("Failed to load admin server configuration")?;
    let topics = parse_topics(&env_or_default("WEBHOOK_TOPICS", DEFAULT_TOPICS));
    if topics.is_empty() {
        eyre::bail!("WEBHOOK_TOPICS must name at least one topic");
    }

    let queue = build_job_queue(&settings)
        .await
        .wrap_err("Failed to build job queue")?;
    if !queue.is_durable_backend_enabled() {
        warn!("Jobs are kept in process memory and are lost on restart");
    }
    queue.set_dlq(Arc::new(DeadLetterLog));

    let options = ConsumeOptions::from_settings(&settings);
    info!(
        driver = %queue.driver_kind(),
        topics = ?topics,
        max_batch = options.max_batch,
        max_concurrent = options.max_concurrent,
        "Worker configuration loaded"
    );

    // Set up a shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let state = HealthState::new(queue.clone(), app_info.name, app_info.version);
    tokio::spawn(async move {
        if let Err(e) = start_admin_server(state, admin_config).await {
            error!(error = %e, "Admin server failed");
        }
    });

    consume_topics(queue, topics, options, shutdown_rx).await?;

    info!("Webhook worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_queue::{EngineConfig, NewJob};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_parse_topics() {
        assert_eq!(
            parse_topics(" orders/create, ,app/uninstalled,orders/create "),
            vec!["orders/create".to_string(), "app/uninstalled".to_string()]
        );
        assert!(parse_topics(" , ").is_empty());
        assert_eq!(parse_topics(DEFAULT_TOPICS).len(), 3);
    }

    #[tokio::test]
    async fn test_processor_rejects_null_payload() {
        let job = Job::pending(NewJob::new("orders/create", "a.myshopify.com", serde_json::Value::Null));
        let err = WebhookProcessor.handle(vec![job]).await.unwrap_err();
        assert!(err.failure_reason().contains("empty payload"));
    }

    #[tokio::test]
    async fn test_consume_topics_drains_and_stops() {
        let queue = JobQueue::in_memory(
            EngineConfig::default().with_idle_wait(Duration::from_millis(1)),
        );
        queue
            .enqueue_webhook_job(NewJob::new("orders/create", "a.myshopify.com", json!({"id": 1})))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(consume_topics(
            queue.clone(),
            vec!["orders/create".to_string(), "app/uninstalled".to_string()],
            ConsumeOptions::default(),
            rx,
        ));

        let mut drained = false;
        for _ in 0..200 {
            if queue.snapshot_queue().await.unwrap().is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(drained);

        tx.send(true).unwrap();
        worker.await.unwrap().unwrap();
    }
}
