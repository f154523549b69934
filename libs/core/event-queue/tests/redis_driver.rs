//! Redis Streams engine and durable job driver.
//!
//! Every test starts its own Redis container, so they are ignored by default:
//! `cargo test -p event-queue -- --ignored`

use event_queue::{
    build_job_queue, handler_fn, job_handler_fn, ConsumeOptions, Consumer, DriverKind,
    EngineConfig, InMemoryDeadLetters, Job, JobQueue, JobStatus, Message, NewJob, Publisher,
    QueueError, QueueSettings, RedisQueue, RetryPolicy,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::assert_eventually;
use test_utils::{TestDataBuilder, TestRedis};
use tokio::sync::watch;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(builder: &TestDataBuilder) -> EngineConfig {
    EngineConfig::default()
        .with_key_prefix(builder.key_prefix())
        .with_idle_wait(Duration::from_millis(5))
        .with_retry(RetryPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(20),
        ))
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_stream_engine_delivers_in_order_and_acks() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_stream_engine_delivers_in_order_and_acks");
    let queue: RedisQueue<Value> = RedisQueue::new(redis.connection_manager().await, config(&builder));

    for n in 1..=3 {
        queue
            .publish("orders", Message::new("shop-a", json!({ "n": n })))
            .await
            .unwrap();
    }
    assert_eq!(queue.list("orders").await.unwrap().len(), 3);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |batch: Vec<Message<Value>>| {
        let sink = sink.clone();
        async move {
            sink.lock()
                .unwrap()
                .extend(batch.iter().map(|m| m.payload["n"].as_i64().unwrap_or_default()));
            Ok(())
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || seen.lock().unwrap().len() == 3, "delivered").await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert!(queue.list("orders").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_stream_engine_dead_letters_after_budget() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_stream_engine_dead_letters_after_budget");
    let queue: RedisQueue<Value> = RedisQueue::new(redis.connection_manager().await, config(&builder));
    let sink = Arc::new(InMemoryDeadLetters::new());
    queue.set_dlq(sink.clone());

    queue
        .publish("orders", Message::new("shop-a", json!({ "n": 1 })))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_batch: Vec<Message<Value>>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::handler("boom"))
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || sink.len() == 1, "dead lettered").await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(sink.list()[0].reason, "boom");

    let stats = queue.dead_letters().stats().await.unwrap();
    assert_eq!(stats.length, 1);
    let stored = queue.dead_letters().list::<Value>(10).await.unwrap();
    assert_eq!(stored[0].reason, "boom");
    assert_eq!(stored[0].message.attempt, 5);
    assert!(queue.list("orders").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_durable_driver_snapshot_and_purge() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_durable_driver_snapshot_and_purge");
    let queue = JobQueue::redis(redis.connection_manager().await, config(&builder));
    assert!(queue.is_durable_backend_enabled());

    let alpha = builder.shop_domain("alpha");
    let beta = builder.shop_domain("beta");
    for (topic, shop) in [
        ("orders/create", alpha.to_uppercase()),
        ("refunds/create", alpha.clone()),
        ("orders/create", beta.clone()),
    ] {
        queue
            .enqueue_webhook_job(NewJob::new(topic, shop, json!({})))
            .await
            .unwrap();
    }

    let snapshot = queue.snapshot_queue().await.unwrap();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.iter().all(|job| job.status == JobStatus::Pending));

    assert_eq!(queue.purge_shop_jobs(&alpha).await.unwrap(), 2);
    let remaining = queue.snapshot_queue().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].shop_domain, beta);

    assert_eq!(queue.clear_queue().await.unwrap(), 1);
    assert!(queue.snapshot_queue().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_durable_driver_rejects_mark_job_status() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_durable_driver_rejects_mark_job_status");
    let queue = JobQueue::redis(redis.connection_manager().await, config(&builder));

    let job = queue
        .enqueue_webhook_job(NewJob::new("orders/create", builder.shop_domain("a"), json!({})))
        .await
        .unwrap();

    let err = queue
        .mark_job_status(&job.id, JobStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::UnsupportedOperation { operation: "mark_job_status", driver: "redis" }
    ));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_durable_driver_consumes_jobs() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_durable_driver_consumes_jobs");
    let queue = JobQueue::redis(redis.connection_manager().await, config(&builder));
    let topic = builder.topic_key("orders/create");

    let job = queue
        .enqueue_webhook_job(NewJob::new(topic.as_str(), builder.shop_domain("a"), json!({"id": 9})))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = job_handler_fn(move |jobs: Vec<Job>| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().extend(jobs);
            Ok(())
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let consume_topic = topic.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume(&consume_topic, handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || !seen.lock().unwrap().is_empty(), "delivered").await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, job.id);
    assert_eq!(delivered[0].status, JobStatus::Processing);
    assert!(queue.snapshot_queue().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_selector_builds_durable_queue() {
    let redis = TestRedis::new().await;
    let settings = QueueSettings {
        use_redis: true,
        redis_url: Some(redis.connection_string().to_string()),
        ..QueueSettings::default()
    };

    let queue = build_job_queue(&settings).await.unwrap();
    assert_eq!(queue.driver_kind(), DriverKind::Redis);
    queue.ping().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_stream_engine_retries_then_succeeds() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_stream_engine_retries_then_succeeds");
    let queue: RedisQueue<Value> = RedisQueue::new(redis.connection_manager().await, config(&builder));
    let sink = Arc::new(InMemoryDeadLetters::new());
    queue.set_dlq(sink.clone());

    queue
        .publish("orders", Message::new("shop-a", json!({ "n": 1 })))
        .await
        .unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    let handler = handler_fn(move |batch: Vec<Message<Value>>| {
        let seen = seen.clone();
        async move {
            let mut seen = seen.lock().unwrap();
            seen.extend(batch.iter().map(|m| m.attempt));
            if seen.len() == 1 {
                Err(QueueError::handler("transient"))
            } else {
                Ok(())
            }
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || attempts.lock().unwrap().len() == 2, "redelivered").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1]);
    assert!(sink.is_empty());
    assert_eq!(queue.dead_letters().stats().await.unwrap().length, 0);
    assert!(queue.list("orders").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_stream_engine_redelivers_own_unacknowledged_entries() {
    let redis = TestRedis::new().await;
    let builder =
        TestDataBuilder::from_test_name("test_stream_engine_redelivers_own_unacknowledged_entries");
    let config = config(&builder)
        .with_consumer_id("ingest-0")
        .with_claim_idle(Duration::from_secs(60));
    let queue: RedisQueue<Value> = RedisQueue::new(redis.connection_manager().await, config.clone());

    queue
        .publish("orders", Message::new("shop-a", json!({ "n": 7 })))
        .await
        .unwrap();

    // A previous run of worker 0 read the entry and died before settling it
    let stream = config.topic_stream("orders");
    let mut conn = redis.connection();
    let _: () = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(&stream)
        .arg(&config.consumer_group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await
        .unwrap();
    let _: redis::Value = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(&config.consumer_group)
        .arg("ingest-0-0")
        .arg("COUNT")
        .arg(10)
        .arg("STREAMS")
        .arg(&stream)
        .arg(">")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(queue.in_flight("orders").await.unwrap().len(), 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |batch: Vec<Message<Value>>| {
        let sink = sink.clone();
        async move {
            sink.lock()
                .unwrap()
                .extend(batch.iter().map(|m| m.payload["n"].as_i64().unwrap_or_default()));
            Ok(())
        }
    });

    let (tx, rx) = watch::channel(false);
    let consumer = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume("orders", handler, ConsumeOptions::default(), rx)
            .await
    });

    assert_eventually(TIMEOUT, || !seen.lock().unwrap().is_empty(), "redelivered").await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![7]);
    assert!(queue.in_flight("orders").await.unwrap().is_empty());
    assert!(queue.list("orders").await.unwrap().is_empty());
}
