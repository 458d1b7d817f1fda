//! The top-level `Locker` facade (§6 "Public API surface"): selects the right shard(s), runs
//! the acquisition engine, and wraps the result in a `Handle` (or a distributed composite).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::distributed::{self, AutoWriteHandle, DistributedWriteHandle};
use crate::engine;
use crate::error::{LockError, LockResult, Role};
use crate::handle::{Handle, ShardRef};
use crate::kv::{KvClient, ShardSelector};
use crate::lock_set::LockSet;
use crate::options::{Distributed, LockOptions, LockerConfig};
use crate::token::TokenGenerator;

/// Either a single-shard write handle or a fan-out over every shard — what `Locker::write_lock`
/// returns when `options.distributed` isn't `Off` (§4.5).
pub enum WriteHandle {
    Single(Arc<Handle>),
    Distributed(DistributedWriteHandle),
}

impl WriteHandle {
    pub async fn release(&self) -> LockResult<()> {
        match self {
            WriteHandle::Single(h) => h.release().await,
            WriteHandle::Distributed(h) => h.release().await,
        }
    }

    pub async fn force_release(&self) -> LockResult<()> {
        match self {
            WriteHandle::Single(h) => h.force_release().await,
            WriteHandle::Distributed(h) => h.force_release().await,
        }
    }
}

/// Top-level entry point: owns the KV client, the per-process token generator, and the locker-
/// wide config (key prefix, distributed-flag timing). Every acquisition funnels through here,
/// whether called directly or via a `LockSet`.
pub struct Locker {
    kv: Arc<dyn KvClient>,
    config: LockerConfig,
    tokens: TokenGenerator,
}

impl Locker {
    pub fn new(kv: Arc<dyn KvClient>, config: LockerConfig) -> Self {
        let tokens = TokenGenerator::new(config.debug_tokens);
        Self { kv, config, tokens }
    }

    /// Block until every atomic script is warmed on every shard (§6 `registerScriptDir`'s
    /// async contract; the crate treats script registration itself as an external collaborator
    /// but still exposes a way to wait on it before the first acquisition).
    pub async fn wait_for_scripts(&self) -> LockResult<()> {
        self.kv.ensure_scripts_registered().await?;
        Ok(())
    }

    fn options_with_defaults(&self, options: Option<&LockOptions>) -> LockOptions {
        options.cloned().unwrap_or_default()
    }

    fn token_for(&self, options: &LockOptions) -> (String, String) {
        match &options.token_base {
            Some(base) if base != self.tokens.base() => {
                let generator = TokenGenerator::with_base(base.clone(), self.config.debug_tokens);
                (generator.next(options.conflict_priority), base.clone())
            }
            _ => (self.tokens.next(options.conflict_priority), self.tokens.base().to_string()),
        }
    }

    /// Acquire a read lease on `key` (§4.3 "Read acquisition", §4.5 distributed reads).
    pub async fn read_lock(&self, key: &str, options: &LockOptions) -> LockResult<Arc<Handle>> {
        let (token, token_base) = self.token_for(options);
        let warn_time = options.warn_time;
        let on_warn = |elapsed: Duration| {
            warn!(key, ?elapsed, ?warn_time, "read lock acquisition exceeded warn threshold");
        };

        if options.distributed != Distributed::Off {
            if options.enable_distributed_auto {
                if let Err(err) = distributed::maintain_distributed_flag(
                    &*self.kv,
                    &self.config.key_prefix,
                    key,
                    self.config.min_distributed_lock_flag_expire,
                    self.config.max_distributed_lock_flag_expire,
                    self.config.distributed_lock_flag_timer_window,
                )
                .await
                {
                    warn!(key, %err, "failed to maintain distributed-flag for read lock");
                }
            }
            return distributed::acquire_distributed_read(
                &*self.kv,
                &self.config.key_prefix,
                key,
                &token,
                &token_base,
                options,
                on_warn,
            )
            .await;
        }

        let shard = self.kv.shard(ShardSelector::Key(key));
        engine::acquire_read(&*shard, &self.config.key_prefix, key, &token, &token_base, options, on_warn).await?;
        Ok(Handle::new(
            key.to_string(),
            token,
            Role::Read,
            self.config.key_prefix.clone(),
            ShardRef { shard, shard_index: usize::MAX },
            options,
        ))
    }

    /// Acquire a write lease on `key` (§4.3 "Write acquisition", §4.5 distributed writes).
    pub async fn write_lock(&self, key: &str, options: &LockOptions) -> LockResult<Arc<Handle>> {
        match self.write_lock_any(key, options).await? {
            WriteHandle::Single(handle) => Ok(handle),
            WriteHandle::Distributed(distributed) => Err(LockError::Internal(format!(
                "write_lock on {key} fanned out to {} shards; use write_lock_any for distributed callers",
                distributed.per_shard().len()
            ))),
        }
    }

    /// Acquire a write lease, returning the distributed composite when `options.distributed`
    /// requests fan-out (§4.5). Prefer this over `write_lock` when the caller may pass
    /// `distributed: true` or `"auto"`.
    pub async fn write_lock_any(&self, key: &str, options: &LockOptions) -> LockResult<WriteHandle> {
        let warn_time = options.warn_time;
        let on_warn = move |elapsed: Duration| {
            warn!(key, ?elapsed, ?warn_time, "write lock acquisition exceeded warn threshold");
        };

        match options.distributed {
            Distributed::Off => {
                let (token, token_base) = self.token_for(options);
                let shard = self.kv.shard(ShardSelector::Key(key));
                engine::acquire_write(&*shard, &self.config.key_prefix, key, &token, &token_base, options, on_warn)
                    .await?;
                Ok(WriteHandle::Single(Handle::new(
                    key.to_string(),
                    token,
                    Role::Write,
                    self.config.key_prefix.clone(),
                    ShardRef { shard, shard_index: usize::MAX },
                    options,
                )))
            }
            Distributed::On => {
                let tokens = self.token_generator_for(options);
                let handle = distributed::acquire_distributed_write(
                    &*self.kv,
                    &self.config.key_prefix,
                    key,
                    &tokens,
                    options,
                    on_warn,
                )
                .await?;
                Ok(WriteHandle::Distributed(handle))
            }
            Distributed::Auto => {
                let tokens = self.token_generator_for(options);
                match distributed::acquire_auto_write(
                    &*self.kv,
                    &self.config.key_prefix,
                    key,
                    &tokens,
                    options,
                    on_warn,
                )
                .await?
                {
                    AutoWriteHandle::Single(handle) => Ok(WriteHandle::Single(handle)),
                    AutoWriteHandle::Distributed(handle) => Ok(WriteHandle::Distributed(handle)),
                }
            }
        }
    }

    fn token_generator_for(&self, options: &LockOptions) -> TokenGenerator {
        match &options.token_base {
            Some(base) if base != self.tokens.base() => {
                TokenGenerator::with_base(base.clone(), self.config.debug_tokens)
            }
            _ => TokenGenerator::with_base(self.tokens.base().to_string(), self.config.debug_tokens),
        }
    }

    /// Run `fn_` with a read lease on `key` held, releasing it whether `fn_` succeeds or fails
    /// (§6 `readLockWrap`).
    pub async fn read_lock_wrap<T, F, Fut>(&self, key: &str, options: &LockOptions, fn_: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LockResult<T>>,
    {
        let handle = self.read_lock(key, options).await?;
        let result = fn_().await;
        handle.release().await?;
        result
    }

    /// Run `fn_` with a write lease on `key` held, releasing it whether `fn_` succeeds or fails
    /// (§6 `writeLockWrap`). Distributed write locks are supported via `write_lock_any`
    /// internally, so the wrapped callback never needs to know about fan-out.
    pub async fn write_lock_wrap<T, F, Fut>(&self, key: &str, options: &LockOptions, fn_: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LockResult<T>>,
    {
        let handle = self.write_lock_any(key, options).await?;
        let result = fn_().await;
        handle.release().await?;
        result
    }

    /// Create a new, empty `LockSet` rooted at this locker.
    pub fn create_lock_set(self: &Arc<Self>) -> Arc<LockSet> {
        LockSet::new(self.clone())
    }

    /// Acquire read locks for every key into a fresh lock set (§6 "readLockSet(keys, options) →
    /// LockSet"). `Locker` and `LockSet` both expose `read_lock`/`write_lock`/`read_lock_set`/
    /// `write_lock_set`/`create_lock_set` with the same signatures — the duck-typed capability
    /// set of §9's design notes — the only difference being that the locker always starts from
    /// an empty set while a `LockSet` augments itself.
    pub async fn read_lock_set(self: &Arc<Self>, keys: &[String], options: &LockOptions) -> LockResult<Arc<LockSet>> {
        self.create_lock_set().read_lock_set(keys, options).await
    }

    /// Acquire write locks for every key into a fresh lock set (§6 "writeLockSet(keys, options)
    /// → LockSet").
    pub async fn write_lock_set(self: &Arc<Self>, keys: &[String], options: &LockOptions) -> LockResult<Arc<LockSet>> {
        self.create_lock_set().write_lock_set(keys, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvClient;
    use std::time::Duration as StdDuration;

    fn test_locker() -> Arc<Locker> {
        let kv = Arc::new(InMemoryKvClient::new(4));
        Arc::new(Locker::new(kv, LockerConfig::default()))
    }

    fn fast_options() -> LockOptions {
        let mut opts = LockOptions::default();
        opts.heartbeat_interval = Some(StdDuration::ZERO);
        opts.max_wait_time = StdDuration::from_millis(200);
        opts
    }

    #[tokio::test]
    async fn write_then_release_then_relock_succeeds_immediately() {
        let locker = test_locker();
        let mut options = fast_options();
        options.max_wait_time = StdDuration::ZERO;

        let h1 = locker.write_lock("k", &options).await.unwrap();
        assert!(h1.token().starts_with("50"));
        h1.release().await.unwrap();

        let h2 = locker.write_lock("k", &options).await.unwrap();
        assert!(h2.is_locked());
    }

    #[tokio::test]
    async fn write_blocks_read_and_read_blocks_write() {
        let locker = test_locker();
        let mut zero_wait = fast_options();
        zero_wait.max_wait_time = StdDuration::ZERO;

        let writer = locker.write_lock("k", &fast_options()).await.unwrap();

        let err = locker.read_lock("k", &zero_wait).await.unwrap_err();
        match err {
            LockError::ResourceLocked { ref key, .. } => assert_eq!(key, "k"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("A lock cannot be acquired on the resource: k"));

        writer.release().await.unwrap();

        let reader = locker.read_lock("k", &fast_options()).await.unwrap();
        let write_err = locker.write_lock("k", &zero_wait).await.unwrap_err();
        assert!(matches!(write_err, LockError::ResourceLocked { .. }));

        reader.release().await.unwrap();
        let writer2 = locker.write_lock("k", &zero_wait).await.unwrap();
        assert!(writer2.is_locked());
    }

    #[tokio::test]
    async fn read_lock_set_at_locker_level_creates_a_fresh_populated_set() {
        let locker = test_locker();
        let keys = vec!["x".to_string(), "y".to_string()];

        let set = locker.read_lock_set(&keys, &fast_options()).await.unwrap();
        assert!(set.get_lock("x").is_some());
        assert!(set.get_lock("y").is_some());

        set.release().await.unwrap();
    }

    #[tokio::test]
    async fn conflict_resolution_picks_lower_token_as_winner() {
        let kv = Arc::new(InMemoryKvClient::new(1));
        let locker_a = Arc::new(Locker::new(kv.clone(), LockerConfig::default()));
        let locker_b = Arc::new(Locker::new(kv, LockerConfig::default()));

        let mut options_a = fast_options();
        options_a.resolve_conflicts = true;
        options_a.token_base = Some("aaaaaaaaaaaaaaaaa".to_string());

        let mut options_b = options_a.clone();
        options_b.token_base = Some("bbbbbbbbbbbbbbbbb".to_string());

        let holder = locker_a.write_lock("foo", &options_a).await.unwrap();

        let err = locker_b.write_lock("foo", &options_b).await.unwrap_err();
        match err {
            LockError::ResourceLocked { reason, .. } => assert_eq!(reason, "conflict resolution"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().to_lowercase().contains("conflict resolution"));

        holder.release().await.unwrap();
    }

    #[tokio::test]
    async fn distributed_read_then_auto_write_goes_distributed() {
        let kv = Arc::new(InMemoryKvClient::new(3));
        let locker = Arc::new(Locker::new(kv, LockerConfig::default()));

        let mut read_opts = fast_options();
        read_opts.distributed = Distributed::On;
        let reader = locker.read_lock("dk", &read_opts).await.unwrap();
        reader.release().await.unwrap();

        let mut auto_opts = fast_options();
        auto_opts.distributed = Distributed::Auto;
        match locker.write_lock_any("dk", &auto_opts).await.unwrap() {
            WriteHandle::Distributed(handle) => {
                assert_eq!(handle.per_shard().len(), 3);
                handle.release().await.unwrap();
            }
            WriteHandle::Single(_) => panic!("expected a distributed handle after a distributed read"),
        }
    }

    #[tokio::test]
    async fn auto_write_without_prior_distributed_read_stays_single_shard() {
        let kv = Arc::new(InMemoryKvClient::new(3));
        let locker = Arc::new(Locker::new(kv, LockerConfig::default()));

        let mut auto_opts = fast_options();
        auto_opts.distributed = Distributed::Auto;
        match locker.write_lock_any("never-distributed", &auto_opts).await.unwrap() {
            WriteHandle::Single(handle) => handle.release().await.unwrap(),
            WriteHandle::Distributed(_) => panic!("expected single-shard handle"),
        }
    }
}
