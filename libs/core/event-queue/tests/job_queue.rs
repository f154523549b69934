//! Job facade over the in-process driver.

use event_queue::{
    job_handler_fn, ConsumeOptions, DriverKind, EngineConfig, InMemoryDeadLetters, Job,
    JobQueue, JobStatus, NewJob, QueueError, RetryPolicy,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::{assert_eventually, assert_some};
use test_utils::TestDataBuilder;
use tokio::sync::watch;

const TIMEOUT: Duration = Duration::from_secs(5);

fn queue() -> JobQueue {
    JobQueue::in_memory(
        EngineConfig::default()
            .with_idle_wait(Duration::from_millis(1))
            .with_retry(RetryPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(8),
            )),
    )
}

async fn enqueue(queue: &JobQueue, topic: &str, shop: &str, n: u32) -> Job {
    queue
        .enqueue_webhook_job(NewJob::new(topic, shop, json!({ "n": n })))
        .await
        .unwrap()
}

async fn job_status(queue: &JobQueue, id: &str) -> JobStatus {
    assert_some(queue.job(id).await.unwrap(), "job exists").status
}

#[tokio::test]
async fn test_enqueue_returns_pending_job() {
    let queue = queue();
    let builder = TestDataBuilder::from_test_name("test_enqueue_returns_pending_job");
    let shop = builder.shop_domain("alpha");

    let job = enqueue(&queue, "orders/create", &shop, 1).await;

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.shop_domain, shop);
    assert_eq!(queue.snapshot_queue().await.unwrap(), vec![job]);
    assert_eq!(queue.driver_kind(), DriverKind::Memory);
}

#[tokio::test]
async fn test_snapshot_is_ordered_by_enqueue_time() {
    let queue = queue();
    let first = enqueue(&queue, "orders/create", "a.myshopify.com", 1).await;
    let second = enqueue(&queue, "refunds/create", "b.myshopify.com", 2).await;
    let third = enqueue(&queue, "orders/create", "c.myshopify.com", 3).await;

    let ids: Vec<String> = queue
        .snapshot_queue()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec![first.id, second.id, third.id]);
}

#[tokio::test]
async fn test_purge_is_case_insensitive_and_spares_other_shops() {
    let queue = queue();
    enqueue(&queue, "orders/create", "Alpha.MyShopify.com", 1).await;
    enqueue(&queue, "refunds/create", "alpha.myshopify.com", 2).await;
    let kept = enqueue(&queue, "orders/create", "beta.myshopify.com", 3).await;

    let purged = queue.purge_shop_jobs("ALPHA.MYSHOPIFY.COM").await.unwrap();

    assert_eq!(purged, 2);
    assert_eq!(queue.snapshot_queue().await.unwrap(), vec![kept]);
}

#[tokio::test]
async fn test_purged_jobs_are_never_delivered() {
    let queue = queue();
    enqueue(&queue, "orders/create", "alpha.myshopify.com", 1).await;
    let kept = enqueue(&queue, "orders/create", "beta.myshopify.com", 2).await;
    queue.purge_shop_jobs("alpha.myshopify.com").await.unwrap();

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let handler = job_handler_fn(move |jobs: Vec<Job>| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().extend(jobs.into_iter().map(|job| job.id));
            Ok(())
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders/create", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || !delivered.lock().unwrap().is_empty(), "delivered").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(*delivered.lock().unwrap(), vec![kept.id]);
}

#[tokio::test]
async fn test_clear_queue_empties_snapshot() {
    let queue = queue();
    enqueue(&queue, "orders/create", "a.myshopify.com", 1).await;
    enqueue(&queue, "refunds/create", "b.myshopify.com", 2).await;

    assert_eq!(queue.clear_queue().await.unwrap(), 2);
    assert!(queue.snapshot_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mark_job_status_lifecycle() {
    let queue = queue();
    let job = enqueue(&queue, "orders/create", "a.myshopify.com", 1).await;

    let processing = queue
        .mark_job_status(&job.id, JobStatus::Processing, None)
        .await
        .unwrap();
    assert_eq!(processing.status, JobStatus::Processing);
    assert_eq!(processing.attempts, 0);

    let failed = queue
        .mark_job_status(&job.id, JobStatus::Failed, Some("bad signature".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.error.as_deref(), Some("bad signature"));

    // Terminal jobs drop out of the snapshot but stay addressable
    assert!(queue.snapshot_queue().await.unwrap().is_empty());
    assert_eq!(job_status(&queue, &job.id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_mark_unknown_job_is_not_found() {
    let queue = queue();
    let err = queue
        .mark_job_status("missing", JobStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn test_consumed_job_completes() {
    let queue = queue();
    let job = enqueue(&queue, "orders/create", "a.myshopify.com", 1).await;

    let seen_status = Arc::new(Mutex::new(Vec::new()));
    let sink = seen_status.clone();
    let handler = job_handler_fn(move |jobs: Vec<Job>| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().extend(jobs.iter().map(|job| job.status));
            Ok(())
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders/create", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || !seen_status.lock().unwrap().is_empty(), "handled").await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(*seen_status.lock().unwrap(), vec![JobStatus::Processing]);
    assert_eq!(job_status(&queue, &job.id).await, JobStatus::Completed);
    assert!(queue.snapshot_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_job_is_failed_and_dead_lettered_after_budget() {
    let queue = queue();
    let dead_letters = Arc::new(InMemoryDeadLetters::new());
    queue.set_dlq(dead_letters.clone());
    let job = enqueue(&queue, "orders/create", "a.myshopify.com", 1).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = job_handler_fn(move |_jobs: Vec<Job>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::handler("shop uninstalled"))
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders/create", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || dead_letters.len() == 1, "dead lettered").await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    let failed = assert_some(queue.job(&job.id).await.unwrap(), "job exists");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 5);
    assert_eq!(failed.error.as_deref(), Some("shop uninstalled"));

    let entry = &dead_letters.list()[0];
    assert_eq!(entry.reason, "shop uninstalled");
    assert_eq!(entry.message.id, job.id);
}

#[tokio::test]
async fn test_purge_matches_mixed_case_shop_domain() {
    let queue = queue();
    enqueue(&queue, "orders/create", "Alpha-Shop.MYSHOPIFY.com", 1).await;
    enqueue(&queue, "orders/create", "Alpha-Shop.MYSHOPIFY.com", 2).await;

    assert_eq!(queue.purge_shop_jobs("alpha-shop.myshopify.com").await.unwrap(), 2);
    assert!(queue.snapshot_queue().await.unwrap().is_empty());
}
