//! Integration tests for the `Datastore` facade.
//!
//! Run with: cargo test -p conveyor-core --test datastore_integration_test
//!
//! Requirements:
//! - A Redis-compatible server reachable at `REDIS_URL`, or Docker
//!   available locally so `testcontainers-modules` can spin one up.

use std::time::Duration;

use conveyor_core::config::DatastoreConfig;
use conveyor_core::store::{Datastore, SetNxOutcome};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use uuid::Uuid;

/// Starts a disposable Redis container and returns a connected
/// [`Datastore`] plus the container handle (dropping it tears the
/// container down).
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
async fn test_set_get_roundtrip() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("greeting");

    assert_eq!(ds.get(&key).await.unwrap(), None);
    ds.set(&key, "hello").await.unwrap();
    assert_eq!(ds.get(&key).await.unwrap(), Some("hello".to_string()));
}

#[tokio::test]
async fn test_set_nx_px_only_sets_once() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("lock:order-1");

    let first = ds.set_nx_px(&key, "token-a", Duration::from_secs(30)).await.unwrap();
    assert_eq!(first, SetNxOutcome::Set);

    let second = ds.set_nx_px(&key, "token-b", Duration::from_secs(30)).await.unwrap();
    assert_eq!(second, SetNxOutcome::AlreadyExists);
    assert_eq!(ds.get(&key).await.unwrap(), Some("token-a".to_string()));
}

#[tokio::test]
async fn test_list_lpush_brpop_is_fifo() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("fifo");

    ds.lpush(&key, "first").await.unwrap();
    ds.lpush(&key, "second").await.unwrap();

    // LPUSH pushes onto the head, BRPOP pops from the tail, so the
    // oldest push comes out first.
    let popped = ds.brpop(&key, Duration::from_millis(200)).await.unwrap();
    assert_eq!(popped, Some("first".to_string()));
}

#[tokio::test]
async fn test_sorted_set_zpopmax_returns_highest_priority() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("priority");

    ds.zadd(&key, "low", 1.0).await.unwrap();
    ds.zadd(&key, "high", 10.0).await.unwrap();
    ds.zadd(&key, "medium", 5.0).await.unwrap();

    let (member, score) = ds.zpopmax(&key).await.unwrap().unwrap();
    assert_eq!(member, "high");
    assert_eq!(score, 10.0);
    assert_eq!(ds.zcard(&key).await.unwrap(), 2);
}

#[tokio::test]
async fn test_hash_set_and_increment() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("progress:job-1");

    ds.hset(&key, "current", "0").await.unwrap();
    let after = ds.hincrby(&key, "current", 5).await.unwrap();
    assert_eq!(after, 5);

    let all = ds.hgetall(&key).await.unwrap();
    assert_eq!(all.get("current"), Some(&"5".to_string()));
}

#[tokio::test]
async fn test_stream_xadd_and_xrange() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("events:global");

    ds.xadd(&key, 1000, &[("kind", "created"), ("job_id", "job-1")])
        .await
        .unwrap();

    let records = ds.xrange(&key, "-", "+").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields.get("kind"), Some(&"created".to_string()));
}

#[tokio::test]
async fn test_stream_xrevrange_is_newest_first() {
    let (ds, _container) = test_datastore().await;
    let key = ds.key("events:ordered");

    ds.xadd(&key, 1000, &[("seq", "1")]).await.unwrap();
    ds.xadd(&key, 1000, &[("seq", "2")]).await.unwrap();

    let records = ds.xrevrange(&key, "+", "-").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].fields.get("seq"), Some(&"2".to_string()));
}
