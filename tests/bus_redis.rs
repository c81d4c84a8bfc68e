//! Redis job bus integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_redis --features redis -- --ignored --nocapture

use std::time::Duration;

use relaybus::bus::{handler_fn, BusError, BusEvent, BusOptions, JobStatus, RedisEventBus};
use relaybus::storage::{ConnectionPool, PoolConfig, RedisManager, StreamConnection};
use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start a Redis container.
///
/// Returns (container, redis_url).
async fn start_redis() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start redis container");

    let host_port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("redis://{}:{}", host, host_port);
    println!("Redis available at: {}", url);

    (container, url)
}

fn pool(url: &str) -> ConnectionPool<RedisManager> {
    ConnectionPool::new(
        RedisManager::new(url).expect("valid redis url"),
        PoolConfig::default(),
    )
    .expect("valid pool config")
}

fn options(stream: &str) -> BusOptions {
    BusOptions::new(stream, "workers", format!("{}:status", stream))
        .with_block_timeout(Duration::from_millis(200))
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_job_lifecycle() {
    let (_container, url) = start_redis().await;
    let bus = RedisEventBus::connect(pool(&url), options("jobs")).await.unwrap();
    bus.subscribe(handler_fn(|message| async move {
        match message.event.event_type.as_str() {
            "ok" => Ok(()),
            _ => Err(BusError::Handler("unsupported".to_string())),
        }
    }))
    .await;

    let good = bus.publish(&BusEvent::new("ok", json!({"n": 1}))).await.unwrap();
    let bad = bus.publish(&BusEvent::new("nope", json!({"n": 2}))).await.unwrap();
    assert_eq!(bus.job_status(&good).await.unwrap(), Some(JobStatus::Pending));

    let consumer = bus.start_consuming("worker-1");
    let good_done = bus.wait_for_completion(&good, Duration::from_millis(20)).unwrap();
    let bad_done = bus.wait_for_completion(&bad, Duration::from_millis(20)).unwrap();
    let (good_done, bad_done) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(good_done, bad_done)
    })
    .await
    .expect("jobs should finish");
    consumer.shutdown().await;

    assert!(good_done.is_ok());
    assert!(matches!(bad_done, Err(BusError::JobFailed(_))));
    assert_eq!(bus.job_status(&good).await.unwrap(), Some(JobStatus::Processed));
    assert_eq!(bus.job_status(&bad).await.unwrap(), Some(JobStatus::Failed));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_init_is_idempotent_and_marks_ready() {
    let (_container, url) = start_redis().await;
    let pool = pool(&url);

    let bus = RedisEventBus::connect(pool.clone(), options("idem")).await.unwrap();
    bus.init().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let sentinel = conn.hash_get("idem:status", "status").await.unwrap();
    assert_eq!(sentinel.as_deref(), Some("ready"));
}
