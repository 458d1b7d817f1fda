//! Owned lease over a key (§4.4). A `Handle` is created by a successful acquisition; it runs
//! its own heartbeat task for the rest of its life and is released exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{KvError, LockError, LockResult, Role};
use crate::keys;
use crate::kv::ShardClient;
use crate::options::{LockOptions, OnError};
use crate::scripts::{HeartbeatOutcome, LockScript};

/// Where a handle's state lives: a plain key on its natural (or distributed-random) shard.
/// Distributed write handles compose several of these rather than extending this type.
pub struct ShardRef {
    pub shard: Arc<dyn ShardClient>,
    pub shard_index: usize,
}

/// The part of a handle's identity that `upgrade` swaps in place: everything else (key,
/// shard, ref count, heartbeat task) stays put across a read→write upgrade.
struct Lease {
    token: String,
    role: Role,
}

struct HeartbeatState {
    join: Option<JoinHandle<()>>,
}

/// An owned read or write lease. Cloning is not provided — ownership of a `Handle` is
/// exclusive to whichever `Locker`/`LockSet` slot created it (§5 "Handles belong exclusively").
pub struct Handle {
    key: String,
    prefix: String,
    lease: RwLock<Lease>,
    shard_ref: ShardRef,
    ref_count: AtomicU32,
    locked: AtomicBool,
    lost: AtomicBool,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Duration,
    heartbeat: Mutex<HeartbeatState>,
}

impl Handle {
    /// Construct a handle for a lease that has already been acquired on the KV store, and
    /// start its heartbeat task if enabled.
    pub fn new(
        key: String,
        token: String,
        role: Role,
        prefix: String,
        shard_ref: ShardRef,
        options: &LockOptions,
    ) -> Arc<Self> {
        let interval = options.effective_heartbeat_interval();
        let timeout = interval.map(|i| options.effective_heartbeat_timeout(i)).unwrap_or(Duration::ZERO);

        let handle = Arc::new(Self {
            key,
            prefix,
            lease: RwLock::new(Lease { token, role }),
            shard_ref,
            ref_count: AtomicU32::new(1),
            locked: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            heartbeat_interval: interval,
            heartbeat_timeout: timeout,
            heartbeat: Mutex::new(HeartbeatState { join: None }),
        });
        handle.start_heartbeat();
        handle
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> String {
        self.lease.read().token.clone()
    }

    pub fn role(&self) -> Role {
        self.lease.read().role
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    fn release_key(&self, role: Role) -> String {
        match role {
            Role::Read => keys::read_key(&self.prefix, &self.key),
            Role::Write => keys::write_key(&self.prefix, &self.key),
        }
    }

    fn release_script(role: Role) -> LockScript {
        match role {
            Role::Read => LockScript::ReadLockRelease,
            Role::Write => LockScript::WriteLockRelease,
        }
    }

    fn heartbeat_script(role: Role) -> LockScript {
        match role {
            Role::Read => LockScript::ReadLockHeartbeat,
            Role::Write => LockScript::WriteLockHeartbeat,
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(join) = self.heartbeat.lock().join.take() {
            join.abort();
        }
    }

    /// Starts the periodic lease-refresh task (§4.4 "Heartbeat"). A no-op if heartbeats are
    /// disabled (no interval, e.g. `lockTimeout` is 0 or the caller set `heartbeatInterval:
    /// false`).
    fn start_heartbeat(self: &Arc<Self>) {
        let Some(interval) = self.heartbeat_interval else { return };
        if interval.is_zero() {
            return;
        }

        let this = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if !this.is_locked() || this.is_lost() {
                    return;
                }

                let (token, role) = {
                    let lease = this.lease.read();
                    (lease.token.clone(), lease.role)
                };
                let key = this.release_key(role);
                let ttl_secs = this.heartbeat_timeout.as_secs().max(1).to_string();
                let result = this
                    .shard_ref
                    .shard
                    .run_script(Self::heartbeat_script(role), &[&key], &[token, ttl_secs])
                    .await;

                match result {
                    Ok(reply) => match HeartbeatOutcome::try_from(reply) {
                        Ok(HeartbeatOutcome::Alive) => {
                            debug!(key = %this.key, role = %role, "heartbeat refreshed lease");
                        }
                        Ok(HeartbeatOutcome::Superseded) | Ok(HeartbeatOutcome::Lost) => {
                            warn!(key = %this.key, role = %role, "heartbeat lost lease");
                            this.lost.store(true, Ordering::Release);
                            return;
                        }
                        Err(err) => {
                            warn!(key = %this.key, %err, "heartbeat reply decode failed");
                            return;
                        }
                    },
                    Err(KvError::ShardUnavailable(_)) => {
                        debug!(key = %this.key, "heartbeat skipped, shard unavailable");
                    }
                    Err(err) => {
                        warn!(key = %this.key, %err, "heartbeat failed");
                        return;
                    }
                }
            }
        });
        self.heartbeat.lock().join = Some(join);
    }

    /// Increment the reference count on an already-locked handle (§4.4 "relock").
    pub fn relock(&self) -> LockResult<()> {
        if !self.is_locked() {
            return Err(LockError::InvalidArgument(format!(
                "cannot relock {key}: already released",
                key = self.key
            )));
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Decrement the reference count; force-releases once it reaches zero (§4.4 "release").
    pub async fn release(&self) -> LockResult<()> {
        if !self.is_locked() {
            return Ok(());
        }
        let prev = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        let remaining = prev.unwrap_or(0).saturating_sub(1);
        if remaining == 0 {
            self.force_release().await
        } else {
            Ok(())
        }
    }

    /// Unconditionally drop the lease regardless of reference count (§4.4 "forceRelease").
    pub async fn force_release(&self) -> LockResult<()> {
        if !self.locked.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_heartbeat();
        self.ref_count.store(0, Ordering::Release);

        let (token, role) = {
            let lease = self.lease.read();
            (lease.token.clone(), lease.role)
        };
        let key = self.release_key(role);
        match self
            .shard_ref
            .shard
            .run_script(Self::release_script(role), &[&key], &[token])
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_benign_on_release() => {
                warn!(key = %self.key, %err, "release error suppressed, shard benign-unavailable");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Upgrade a still-locked read handle to a write lease on the same key (§4.4 "upgrade").
    /// `acquire_write` is supplied by the caller (`Locker`/`LockSet`) since it owns the KV
    /// client and token generator this handle doesn't carry directly.
    pub async fn upgrade<F, Fut>(self: &Arc<Self>, on_error: OnError, acquire_write: F) -> LockResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = LockResult<Arc<Handle>>>,
    {
        if self.role() == Role::Write {
            return Ok(());
        }
        if !self.is_locked() {
            return Err(LockError::InvalidArgument(format!(
                "cannot upgrade {key}: handle already released",
                key = self.key
            )));
        }

        self.force_release().await?;

        match acquire_write().await {
            Ok(new_handle) => {
                new_handle.stop_heartbeat();
                {
                    let mut lease = self.lease.write();
                    lease.token = new_handle.token();
                    lease.role = Role::Write;
                }
                self.locked.store(true, Ordering::Release);
                self.ref_count.store(new_handle.ref_count(), Ordering::Release);
                self.start_heartbeat();
                Ok(())
            }
            Err(err) => {
                if matches!(on_error, OnError::Release) {
                    self.force_release().await.ok();
                }
                Err(err)
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{InMemoryKvClient, KvClient, ShardSelector};

    fn options_no_heartbeat() -> LockOptions {
        let mut opts = LockOptions::default();
        opts.heartbeat_interval = Some(Duration::ZERO);
        opts
    }

    #[tokio::test]
    async fn release_is_idempotent_noop_after_force_release() {
        let client = InMemoryKvClient::new(1);
        let shard = client.shard(ShardSelector::Key("k"));
        let write_k = keys::write_key("p:", "k");
        let read_k = keys::read_key("p:", "k");
        shard
            .run_script(LockScript::WriteLockAcquire, &[&write_k, &read_k], &["tok".to_string(), "0".to_string()])
            .await
            .unwrap();

        let handle = Handle::new(
            "k".to_string(),
            "tok".to_string(),
            Role::Write,
            "p:".to_string(),
            ShardRef { shard: shard.clone(), shard_index: 0 },
            &options_no_heartbeat(),
        );

        handle.force_release().await.unwrap();
        assert!(!handle.is_locked());
        // second release is a no-op, not an error
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn relock_increments_and_release_decrements_ref_count() {
        let client = InMemoryKvClient::new(1);
        let shard = client.shard(ShardSelector::Key("k"));
        let write_k = keys::write_key("p:", "k");
        let read_k = keys::read_key("p:", "k");
        shard
            .run_script(LockScript::WriteLockAcquire, &[&write_k, &read_k], &["tok".to_string(), "0".to_string()])
            .await
            .unwrap();

        let handle = Handle::new(
            "k".to_string(),
            "tok".to_string(),
            Role::Write,
            "p:".to_string(),
            ShardRef { shard: shard.clone(), shard_index: 0 },
            &options_no_heartbeat(),
        );
        handle.relock().unwrap();
        assert_eq!(handle.ref_count(), 2);
        handle.release().await.unwrap();
        assert!(handle.is_locked());
        assert_eq!(handle.ref_count(), 1);
        handle.release().await.unwrap();
        assert!(!handle.is_locked());
    }
}
