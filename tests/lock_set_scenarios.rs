// Integration tests for lock-set reference counting and read-to-write upgrade (spec scenario 4).

use std::sync::Arc;
use std::time::Duration;

use rzlock::{InMemoryKvClient, Locker, LockerConfig, LockOptions, Role};

mod support;

fn fast_options() -> LockOptions {
    let mut opts = LockOptions::default();
    opts.heartbeat_interval = Some(Duration::ZERO);
    opts.max_wait_time = Duration::from_millis(200);
    opts
}

#[tokio::test]
async fn read_then_write_upgrade_shares_one_handle_with_symmetric_release() {
    support::init_tracing();
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv, LockerConfig::default()));
    let set = locker.create_lock_set();

    let l1 = set.read_lock("k1", &fast_options()).await.unwrap();
    assert_eq!(l1.ref_count(), 1);
    assert_eq!(l1.role(), Role::Read);

    let l1_again = set.write_lock("k1", &fast_options()).await.unwrap();
    assert!(Arc::ptr_eq(&l1, &l1_again));
    assert_eq!(l1.role(), Role::Write);
    assert_eq!(l1.ref_count(), 2);

    l1.release().await.unwrap();
    assert!(l1.is_locked());
    assert_eq!(l1.ref_count(), 1);

    l1.release().await.unwrap();
    assert!(!l1.is_locked());
}

#[tokio::test]
async fn bulk_read_lock_set_rolls_back_only_keys_acquired_in_this_call() {
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv, LockerConfig::default()));
    let set = locker.create_lock_set();

    // Pre-populate "a" with a write lock held outside the set, so the bulk call's attempt on
    // "a" fails after it has already grabbed "pre" and "before-a".
    let blocker = locker.write_lock("a", &fast_options()).await.unwrap();

    let mut zero_wait = fast_options();
    zero_wait.max_wait_time = Duration::ZERO;

    let keys = vec!["pre".to_string(), "before-a".to_string(), "a".to_string(), "after-a".to_string()];
    let err = set.read_lock_set(&keys, &zero_wait).await.unwrap_err();
    assert!(err.to_string().contains("A lock cannot be acquired on the resource: a"));

    // "pre" and "before-a" were acquired in this call and must have been rolled back.
    assert!(set.get_lock("pre").is_none());
    assert!(set.get_lock("before-a").is_none());
    assert!(set.get_lock("a").is_none());
    assert!(set.get_lock("after-a").is_none());

    blocker.release().await.unwrap();
}

#[tokio::test]
async fn dependent_set_upgrade_with_ignore_policy_collects_failures() {
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv.clone(), LockerConfig::default()));
    let set = locker.create_lock_set();

    let reader = set.read_lock("contested", &fast_options()).await.unwrap();
    assert_eq!(reader.role(), Role::Read);

    // A second process holds a competing reader on the same key so the set's upgrade attempt
    // cannot drain and must fail fast under a zero wait.
    let other_locker = Arc::new(Locker::new(kv, LockerConfig::default()));
    let competing_reader = other_locker.read_lock("contested", &fast_options()).await.unwrap();

    let mut zero_wait = fast_options();
    zero_wait.max_wait_time = Duration::ZERO;
    zero_wait.on_error = rzlock::OnError::Ignore;

    let failed = set.upgrade(&zero_wait).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key(), "contested");
    assert_eq!(failed[0].role(), Role::Read);

    competing_reader.release().await.unwrap();
    set.release().await.unwrap();
}

#[tokio::test]
async fn upgrade_with_release_policy_tears_down_whole_set_on_first_failure() {
    support::init_tracing();
    let kv = Arc::new(InMemoryKvClient::new(1));
    let locker = Arc::new(Locker::new(kv.clone(), LockerConfig::default()));
    let set = locker.create_lock_set();

    set.read_lock("clean", &fast_options()).await.unwrap();
    set.read_lock("contested", &fast_options()).await.unwrap();

    let other_locker = Arc::new(Locker::new(kv, LockerConfig::default()));
    let competing_reader = other_locker.read_lock("contested", &fast_options()).await.unwrap();

    let mut zero_wait = fast_options();
    zero_wait.max_wait_time = Duration::ZERO;
    zero_wait.on_error = rzlock::OnError::Release;

    let err = set.upgrade(&zero_wait).await.unwrap_err();
    assert!(err.to_string().contains("contested"));

    // A release policy failure tears down every handle the set was holding, not just the one
    // that failed to upgrade.
    assert!(set.get_lock("clean").is_none());
    assert!(set.get_lock("contested").is_none());

    competing_reader.release().await.unwrap();
}
