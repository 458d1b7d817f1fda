//! Ref-counted handle aggregator with dependent sets and bulk operations (§4.6).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LockError, LockResult, Role};
use crate::locker::Locker;
use crate::options::{LockOptions, OnError};
use crate::token::TokenGenerator;

use crate::handle::Handle;

/// Aggregates handles by key with reference counting, dependent (nested) sets, and bulk
/// release/force-release/upgrade (§3, §4.6). Insertion order is preserved so release can walk
/// it in reverse — the last lock acquired is the first released.
pub struct LockSet {
    locker: Arc<Locker>,
    /// Per-set token base so every writer this set acquires shares conflict-resolution
    /// identity (§4.6 "a per-set tokenBase used for writes").
    token_base: String,
    inner: Mutex<Inner>,
}

struct Inner {
    order: Vec<String>,
    locks: std::collections::HashMap<String, Arc<Handle>>,
    dependents: Vec<Arc<LockSet>>,
}

impl LockSet {
    pub(crate) fn new(locker: Arc<Locker>) -> Arc<Self> {
        let token_base = TokenGenerator::new(false).base().to_string();
        Arc::new(Self {
            locker,
            token_base,
            inner: Mutex::new(Inner {
                order: Vec::new(),
                locks: std::collections::HashMap::new(),
                dependents: Vec::new(),
            }),
        })
    }

    fn with_token_base(options: &LockOptions, token_base: &str) -> LockOptions {
        let mut options = options.clone();
        if options.token_base.is_none() {
            options.token_base = Some(token_base.to_string());
        }
        options
    }

    /// Insert an already-acquired handle. Fails if the key is already present (§4.6 addLock).
    pub fn add_lock(&self, lock: Arc<Handle>) -> LockResult<()> {
        let mut inner = self.inner.lock();
        let key = lock.key().to_string();
        if inner.locks.contains_key(&key) {
            return Err(LockError::InvalidArgument(format!(
                "lock set already holds a lock for key {key}"
            )));
        }
        inner.order.push(key.clone());
        inner.locks.insert(key, lock);
        Ok(())
    }

    /// Register a new empty dependent set, released (recursively, reverse order) when this set
    /// releases (§4.6 createLockSet).
    pub fn add_dependent_lock_set(&self, dependent: Arc<LockSet>) {
        self.inner.lock().dependents.push(dependent);
    }

    /// Create and register a fresh dependent set in one call.
    pub fn create_lock_set(self: &Arc<Self>) -> Arc<LockSet> {
        let child = LockSet::new(self.locker.clone());
        self.add_dependent_lock_set(child.clone());
        child
    }

    /// Retrieve the handle held for `key`, if any.
    pub fn get_lock(&self, key: &str) -> Option<Arc<Handle>> {
        self.inner.lock().locks.get(key).cloned()
    }

    /// If the set already holds `key`, bump its ref count and return it; else acquire a fresh
    /// read lock through the underlying locker and insert it (§4.6 readLock).
    pub async fn read_lock(self: &Arc<Self>, key: &str, options: &LockOptions) -> LockResult<Arc<Handle>> {
        if let Some(existing) = self.get_lock(key) {
            existing.relock()?;
            return Ok(existing);
        }
        let options = Self::with_token_base(options, &self.token_base);
        let handle = self.locker.read_lock(key, &options).await?;
        self.add_lock(handle.clone())?;
        Ok(handle)
    }

    /// If already held, upgrade that handle to write (no-op if already a writer) and bump its
    /// ref count; else acquire fresh as a writer and insert (§4.6 writeLock).
    pub async fn write_lock(self: &Arc<Self>, key: &str, options: &LockOptions) -> LockResult<Arc<Handle>> {
        let options = Self::with_token_base(options, &self.token_base);
        if let Some(existing) = self.get_lock(key) {
            if existing.role() != Role::Write {
                let locker = self.locker.clone();
                let key_owned = key.to_string();
                let acquire_options = options.clone();
                existing
                    .upgrade(options.on_error, || async move {
                        locker.write_lock(&key_owned, &acquire_options).await
                    })
                    .await?;
            }
            existing.relock()?;
            return Ok(existing);
        }
        let handle = self.locker.write_lock(key, &options).await?;
        self.add_lock(handle.clone())?;
        Ok(handle)
    }

    /// Acquire read locks for every key not already held in this set (§4.6 readLockSet). On
    /// any failure, release only the handles acquired *in this call* before rethrowing. Returns
    /// this set (possibly pre-existing, now augmented), matching `Locker::read_lock_set`'s
    /// signature so both sides of the capability set are interchangeable (§9 design notes).
    pub async fn read_lock_set(self: &Arc<Self>, keys: &[String], options: &LockOptions) -> LockResult<Arc<Self>> {
        let mut acquired_here = Vec::new();
        for key in keys {
            if self.get_lock(key).is_some() {
                continue;
            }
            match self.read_lock(key, options).await {
                Ok(handle) => acquired_here.push(handle),
                Err(err) => {
                    for handle in acquired_here.iter().rev() {
                        handle.force_release().await.ok();
                        self.inner.lock().remove(handle.key());
                    }
                    return Err(err);
                }
            }
        }
        Ok(self.clone())
    }

    /// Acquire write locks for every key not already held in this set (§4.6 writeLockSet).
    pub async fn write_lock_set(self: &Arc<Self>, keys: &[String], options: &LockOptions) -> LockResult<Arc<Self>> {
        let mut acquired_here = Vec::new();
        for key in keys {
            if self.get_lock(key).is_some() {
                continue;
            }
            match self.write_lock(key, options).await {
                Ok(handle) => acquired_here.push(handle),
                Err(err) => {
                    for handle in acquired_here.iter().rev() {
                        handle.force_release().await.ok();
                        self.inner.lock().remove(handle.key());
                    }
                    return Err(err);
                }
            }
        }
        Ok(self.clone())
    }

    /// Release all owned handles in reverse insertion order, then all dependent sets in
    /// reverse insertion order (§4.6 release). Idempotent: a second call on an already-cleared
    /// set is a no-op.
    pub async fn release(&self) -> LockResult<()> {
        let (order, dependents, locks) = {
            let mut inner = self.inner.lock();
            let order = std::mem::take(&mut inner.order);
            let dependents = std::mem::take(&mut inner.dependents);
            let locks = std::mem::take(&mut inner.locks);
            (order, dependents, locks)
        };
        for key in order.iter().rev() {
            if let Some(handle) = locks.get(key) {
                handle.release().await?;
            }
        }
        for dependent in dependents.iter().rev() {
            dependent.release().await?;
        }
        Ok(())
    }

    /// Force-release every owned handle (ignoring ref counts), then every dependent set, both
    /// in reverse insertion order (§4.6 forceRelease).
    pub async fn force_release(&self) -> LockResult<()> {
        let (order, dependents, locks) = {
            let mut inner = self.inner.lock();
            let order = std::mem::take(&mut inner.order);
            let dependents = std::mem::take(&mut inner.dependents);
            let locks = std::mem::take(&mut inner.locks);
            (order, dependents, locks)
        };
        for key in order.iter().rev() {
            if let Some(handle) = locks.get(key) {
                handle.force_release().await?;
            }
        }
        for dependent in dependents.iter().rev() {
            dependent.force_release().await?;
        }
        Ok(())
    }

    /// Upgrade every held handle to write, in reverse insertion order (§4.6 upgrade).
    ///
    /// - `OnError::Stop`: rethrow immediately at the first failure.
    /// - `OnError::Release`: release the whole set, then rethrow.
    /// - `OnError::Ignore`: collect failed handles and return them; empty means every upgrade
    ///   succeeded.
    pub async fn upgrade(self: &Arc<Self>, options: &LockOptions) -> LockResult<Vec<Arc<Handle>>> {
        let order = self.inner.lock().order.clone();
        let mut failed = Vec::new();

        for key in order.iter().rev() {
            let Some(handle) = self.get_lock(key) else { continue };
            if handle.role() == Role::Write {
                continue;
            }
            let locker = self.locker.clone();
            let key_owned = key.clone();
            let upgrade_options = Self::with_token_base(options, &self.token_base);
            let result = handle
                .upgrade(options.on_error, || async move { locker.write_lock(&key_owned, &upgrade_options).await })
                .await;

            if let Err(err) = result {
                match options.on_error {
                    OnError::Stop => return Err(err),
                    OnError::Release => {
                        self.release().await.ok();
                        return Err(err);
                    }
                    OnError::Ignore => failed.push(handle.clone()),
                }
            }
        }
        Ok(failed)
    }
}

impl Inner {
    fn remove(&mut self, key: &str) {
        self.locks.remove(key);
        self.order.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvClient;
    use crate::options::LockerConfig;
    use std::time::Duration;

    fn test_locker() -> Arc<Locker> {
        let kv = Arc::new(InMemoryKvClient::new(1));
        Arc::new(Locker::new(kv, LockerConfig::default()))
    }

    fn fast_options() -> LockOptions {
        let mut opts = LockOptions::default();
        opts.heartbeat_interval = Some(Duration::ZERO);
        opts.max_wait_time = Duration::from_millis(200);
        opts
    }

    #[tokio::test]
    async fn reacquiring_same_key_reuses_handle_and_increments_ref_count() {
        let locker = test_locker();
        let set = locker.create_lock_set();

        let h1 = set.read_lock("k1", &fast_options()).await.unwrap();
        assert_eq!(h1.ref_count(), 1);

        let h2 = set.read_lock("k1", &fast_options()).await.unwrap();
        assert_eq!(h2.ref_count(), 2);
        assert!(Arc::ptr_eq(&h1, &h2));
    }

    #[tokio::test]
    async fn release_is_reverse_insertion_order_and_idempotent() {
        let locker = test_locker();
        let set = locker.create_lock_set();
        set.read_lock("a", &fast_options()).await.unwrap();
        set.read_lock("b", &fast_options()).await.unwrap();

        set.release().await.unwrap();
        assert!(set.get_lock("a").is_none());
        assert!(set.get_lock("b").is_none());

        // second release is a no-op
        set.release().await.unwrap();

        // release must have actually dropped the KV-side state, not just the local map:
        // a fresh zero-wait write lock on either key must succeed immediately.
        let mut zero_wait = fast_options();
        zero_wait.max_wait_time = Duration::ZERO;
        let a = locker.write_lock("a", &zero_wait).await.unwrap();
        let b = locker.write_lock("b", &zero_wait).await.unwrap();
        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn dependent_sets_release_with_parent() {
        let locker = test_locker();
        let parent = locker.create_lock_set();
        let child = parent.create_lock_set();
        child.read_lock("child-key", &fast_options()).await.unwrap();

        parent.release().await.unwrap();
        assert!(child.get_lock("child-key").is_none());
    }
}
