// Integration tests for heartbeat lease renewal and TTL expiry (spec scenario 5) and the
// maxWaitTime=0 / lockTimeout=0 boundary behaviors (spec §8 "Boundary behaviors").

use std::sync::Arc;
use std::time::Duration;

use rzlock::{InMemoryKvClient, Locker, LockerConfig, LockOptions};

mod support;

// The in-memory KV double models Redis EXPIRE's integer-seconds TTL granularity, so any
// non-zero lock_timeout rounds up to at least one second (see `engine::ttl_secs`). These tests
// use a 1-2s window accordingly.

#[tokio::test]
async fn heartbeat_keeps_write_lock_alive_past_its_lock_timeout() {
    support::init_tracing();
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv, LockerConfig::default()));

    let mut options = LockOptions::default();
    options.lock_timeout = Some(Duration::from_secs(1));
    options.heartbeat_interval = Some(Duration::from_millis(200));
    options.heartbeat_timeout = Duration::from_secs(1);

    let holder = locker.write_lock("k", &options).await.unwrap();

    // Wait past the raw lock_timeout. Without a live heartbeat the TTL would have expired.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut contender_opts = options.clone();
    contender_opts.max_wait_time = Duration::from_millis(100);
    let err = locker.write_lock("k", &contender_opts).await.unwrap_err();
    assert!(matches!(err, rzlock::LockError::ResourceLocked { .. }));

    holder.release().await.unwrap();

    let second = locker.write_lock("k", &contender_opts).await.unwrap();
    second.release().await.unwrap();
}

#[tokio::test]
async fn no_heartbeat_and_short_timeout_lets_lock_auto_expire() {
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv, LockerConfig::default()));

    let mut options = LockOptions::default();
    options.lock_timeout = Some(Duration::from_secs(1));
    options.heartbeat_interval = Some(Duration::ZERO); // heartbeats disabled

    let holder = locker.write_lock("k", &options).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut contender_opts = options.clone();
    contender_opts.max_wait_time = Duration::from_millis(200);
    let acquired = locker.write_lock("k", &contender_opts).await.unwrap();
    acquired.release().await.unwrap();

    // The original handle never heard back that it lost the lease; releasing it locally is
    // still a safe no-op against remote state (it no longer owns the slot).
    holder.release().await.unwrap();
}

#[tokio::test]
async fn zero_max_wait_time_fails_fast_with_no_sleep() {
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv, LockerConfig::default()));

    let mut options = LockOptions::default();
    options.heartbeat_interval = Some(Duration::ZERO);
    let holder = locker.write_lock("k", &options).await.unwrap();

    let mut zero_wait = options.clone();
    zero_wait.max_wait_time = Duration::ZERO;

    let start = tokio::time::Instant::now();
    let err = locker.write_lock("k", &zero_wait).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(30));
    match err {
        rzlock::LockError::ResourceLocked { reason, .. } => assert_eq!(reason, "zero wait"),
        other => panic!("unexpected error: {other:?}"),
    }

    holder.release().await.unwrap();
}

#[tokio::test]
async fn shard_unavailable_is_a_transient_miss_the_engine_retries_through() {
    support::init_tracing();
    let kv = Arc::new(InMemoryKvClient::new(1));
    kv.set_shard_down(0, true);
    let locker = Arc::new(Locker::new(kv.clone(), LockerConfig::default()));

    let mut options = LockOptions::default();
    options.heartbeat_interval = Some(Duration::ZERO);
    options.max_wait_time = Duration::from_secs(5);

    let acquiring = {
        let locker = locker.clone();
        let options = options.clone();
        tokio::spawn(async move { locker.write_lock("k", &options).await })
    };

    // Give the engine a few failed attempts against the down shard before it comes back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    kv.set_shard_down(0, false);

    let handle = tokio::time::timeout(Duration::from_secs(2), acquiring)
        .await
        .expect("acquisition should resolve once the shard recovers")
        .unwrap()
        .unwrap();
    handle.release().await.unwrap();
}

#[tokio::test]
async fn lock_timeout_zero_means_no_expiry_until_released() {
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv, LockerConfig::default()));

    let mut options = LockOptions::default();
    options.lock_timeout = None;
    options.heartbeat_interval = Some(Duration::ZERO);

    let holder = locker.write_lock("persistent", &options).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut zero_wait = options.clone();
    zero_wait.max_wait_time = Duration::ZERO;
    assert!(locker.write_lock("persistent", &zero_wait).await.is_err());

    holder.release().await.unwrap();
    let reacquired = locker.write_lock("persistent", &zero_wait).await.unwrap();
    reacquired.release().await.unwrap();
}
