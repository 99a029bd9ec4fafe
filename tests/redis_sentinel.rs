//! Redis integration tests.
//!
//! Run with: cargo test --test redis_sentinel -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379.
//! The sentinel test also needs SENTINEL_URI, a connection string such as
//! `localhost:26379,serviceName=mymaster`.
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentinel_bus::broker::{Broker, RedisBroker};
use sentinel_bus::{BusConnection, BusSettings, RestoreOutcome, TracingSink};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "localhost:6379".to_string())
}

fn test_key() -> String {
    format!("test_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn connection() -> BusConnection {
    let settings = BusSettings {
        health_check_interval_ms: 200,
        ..BusSettings::default()
    };
    BusConnection::with_redis(&settings)
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_publish_subscribe_roundtrip() {
    println!("Connecting to: {}", redis_uri());
    let key = test_key();
    let bus = connection();
    bus.connect(&redis_uri(), Arc::new(TracingSink))
        .await
        .expect("Failed to connect to Redis");

    let ids = Arc::new(Mutex::new(Vec::new()));
    let seen = ids.clone();
    bus.subscribe(&key, move |m| seen.lock().unwrap().push(m.id))
        .await
        .expect("subscribe failed");
    // Let the subscription settle before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for expected in 1..=3 {
        assert_eq!(bus.publish(0, &key, b"payload").await.unwrap(), expected);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(*ids.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(bus.latest_message_id(), 3);

    bus.close(&key, true).await;
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_restore_never_regresses() {
    let key = test_key();
    let bus = connection();
    bus.connect(&redis_uri(), Arc::new(TracingSink))
        .await
        .expect("Failed to connect to Redis");

    bus.subscribe(&key, |_| {}).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for _ in 0..2 {
        bus.publish(0, &key, b"x").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Counter already at the latest id.
    assert_eq!(
        bus.restore_latest_value_for_key(0, &key).await,
        RestoreOutcome::Unchanged
    );

    // Simulate a stale primary.
    bus.script_evaluate(0, "return redis.call('SET', KEYS[1], ARGV[1])", &key, "0")
        .await
        .unwrap();
    assert_eq!(
        bus.restore_latest_value_for_key(0, &key).await,
        RestoreOutcome::Restored(2)
    );

    bus.script_evaluate(0, "return redis.call('DEL', KEYS[1])", &key, "")
        .await
        .unwrap();
    bus.close(&key, true).await;
}

#[tokio::test]
#[ignore = "requires running Redis Sentinel"]
async fn test_sentinel_resolves_primary() {
    let Ok(sentinel) = std::env::var("SENTINEL_URI") else {
        println!("SENTINEL_URI not set, skipping");
        return;
    };
    let bus = connection();
    bus.connect(&sentinel, Arc::new(TracingSink))
        .await
        .expect("Failed to connect through Sentinel");

    assert!(bus.is_sentinel());
    let primary = bus.current_endpoint().expect("no primary");
    let link = bus.discovery().expect("discovery link");
    assert_eq!(link.resolve_master().await.unwrap(), primary);

    let key = test_key();
    bus.publish(0, &key, b"x").await.unwrap();
    bus.close(&key, false).await;
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_direct_session_rejects_master_lookup() {
    let options = sentinel_bus::ConnectionOptions::parse(&redis_uri()).unwrap();
    let session = RedisBroker::default()
        .connect(&options)
        .await
        .expect("Failed to connect to Redis");

    assert!(session.is_connected());
    assert!(session.master_address("mymaster").await.is_err());
    session.close(true).await;
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_client_name_is_applied() {
    let name = test_key();
    let options =
        sentinel_bus::ConnectionOptions::parse(&format!("{},name={name}", redis_uri())).unwrap();
    let session = RedisBroker::default()
        .connect(&options)
        .await
        .expect("Failed to connect to Redis");

    let endpoint = session.endpoint();
    let client = redis::Client::open(format!("redis://{}:{}", endpoint.host, endpoint.port))
        .expect("invalid Redis URI");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");
    let clients: String = redis::cmd("CLIENT")
        .arg("LIST")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(clients.contains(&format!("name={name}")));

    session.close(false).await;
}
