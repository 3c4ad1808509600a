//! Integration tests for the queue + worker pool lifecycle.
//!
//! Run with: cargo test -p conveyor-runtime --test queue_worker_integration_test
//!
//! Requirements:
//! - A Redis-compatible server reachable at `REDIS_URL`, or Docker
//!   available locally so `testcontainers-modules` can spin one up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::config::DatastoreConfig;
use conveyor_core::job::Job;
use conveyor_core::store::Datastore;
use conveyor_runtime::dlq::DlqSink;
use conveyor_runtime::events::{EventKind, EventStream};
use conveyor_runtime::queue::Queue;
use conveyor_runtime::worker::{WorkerPool, WorkerPoolConfig};
use serde_json::json;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use uuid::Uuid;

async fn test_datastore() -> (Datastore, ContainerAsync<Redis>) {
    let container = Redis::default()
        .start()
        .await
        .expect("failed to start redis container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("container port");

    let config = DatastoreConfig::default()
        .with_url(format!("redis://{host}:{port}"))
        .with_key_prefix(format!("test-{}", Uuid::new_v4()));

    let datastore = Datastore::connect(&config).await.expect("connect to redis");
    (datastore, container)
}

#[tokio::test]
async fn test_priority_job_dequeues_before_fifo() {
    let (ds, _container) = test_datastore().await;
    let queue = Queue::new(ds, "orders");

    let low = Job::new("ship_order", json!({"order": "low"}));
    let high = Job::new("ship_order", json!({"order": "high"})).with_priority(10);

    queue.enqueue(&low).await.unwrap();
    queue.enqueue(&high).await.unwrap();

    let first = queue.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(first.id(), high.id());
}

#[tokio::test]
async fn test_corrupt_payload_is_quarantined_to_dlq() {
    let (ds, _container) = test_datastore().await;
    let queue = Queue::new(ds.clone(), "orders");

    ds.lpush(&ds.key("orders"), "not valid json").await.unwrap();

    let result = queue.dequeue(Duration::from_millis(200)).await;
    assert!(result.is_err());
    assert_eq!(queue.dlq_len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_worker_pool_retries_then_dlqs_after_exhausting_attempts() {
    let (ds, _container) = test_datastore().await;
    let events = EventStream::new(ds.clone());
    let queue = Arc::new(Queue::new(ds.clone(), "charges").with_events(events.clone()));
    let dlq = Arc::new(DlqSink::new(ds.clone(), "charges", Queue::new(ds.clone(), "charges")));

    let pool = WorkerPool::new(queue.clone(), WorkerPoolConfig::new(1))
        .with_dlq(dlq.clone())
        .with_events(events.clone());

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    pool.register_handler("charge_card", 2, move |_job, _cancel| {
        let attempts = attempts_clone.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("card declined".to_string())
        }
    });

    let job = Job::new("charge_card", json!({"amount": 500}));
    let job_id = job.id().clone();
    queue.enqueue(&job).await.unwrap();

    pool.start();

    // max_retries=2 means 3 total attempts (1 initial + 2 retries) before DLQ.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if dlq.len().await.unwrap() == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never reached the DLQ");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pool.shutdown().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let history = events.job_history(&job_id).await.unwrap();
    let kinds: Vec<EventKind> = history.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Queued,
            EventKind::Started,
            EventKind::Failed,
            EventKind::Started,
            EventKind::Failed,
            EventKind::Started,
            EventKind::Failed,
            EventKind::Dlq,
        ]
    );
}

#[tokio::test]
async fn test_worker_pool_emits_completed_event_on_success() {
    let (ds, _container) = test_datastore().await;
    let events = EventStream::new(ds.clone());
    let queue = Arc::new(Queue::new(ds.clone(), "emails").with_events(events.clone()));

    let pool = WorkerPool::new(queue.clone(), WorkerPoolConfig::new(1)).with_events(events.clone());
    pool.register_handler("send_email", 1, |_job, _cancel| async { Ok(()) });

    let job = Job::new("send_email", json!({"to": "a@example.com"}));
    let job_id = job.id().clone();
    queue.enqueue(&job).await.unwrap();

    pool.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let history = events.job_history(&job_id).await.unwrap();
        if history.iter().any(|e| e.kind == EventKind::Completed) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pool.shutdown().await.unwrap();
}
