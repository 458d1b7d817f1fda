//! Distributed mode (§4.5): reads land on a random shard, writes fan out to every shard, and
//! "auto" writers consult a distributed-flag to decide which of those two to do.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, warn};

use crate::engine;
use crate::error::{LockResult, Role};
use crate::handle::{Handle, ShardRef};
use crate::keys;
use crate::kv::KvClient;
use crate::options::LockOptions;
use crate::token::TokenGenerator;

/// Pick a uniform-random shard index for a distributed read.
pub fn random_shard_index(num_shards: usize) -> usize {
    rand::thread_rng().gen_range(0..num_shards.max(1))
}

/// Acquire a distributed read lock: stores the reader on a random shard rather than the key's
/// natural shard (§4.5 first paragraph).
pub async fn acquire_distributed_read(
    kv: &dyn KvClient,
    prefix: &str,
    key: &str,
    token: &str,
    token_base: &str,
    options: &LockOptions,
    on_warn: impl FnMut(Duration),
) -> LockResult<Arc<Handle>> {
    let shard_index = random_shard_index(kv.num_shards());
    let shard = kv.shard_at(shard_index);

    engine::acquire_read(&*shard, prefix, key, token, token_base, options, on_warn).await?;

    Ok(Handle::new(
        key.to_string(),
        token.to_string(),
        Role::Read,
        prefix.to_string(),
        ShardRef { shard, shard_index },
        options,
    ))
}

/// Maintain the distributed-flag for `key` on every shard (§4.5 "Distributed-flag
/// maintenance"). Returns the delay until this should be called again, biased toward later
/// times to avoid a thundering herd of simultaneous renewals.
pub async fn maintain_distributed_flag(
    kv: &dyn KvClient,
    prefix: &str,
    key: &str,
    min_expire: Duration,
    max_expire: Duration,
    timer_window: Duration,
) -> LockResult<Duration> {
    let flag_key = keys::dflag_key(prefix, key);
    let mut needs_refresh = false;
    let mut min_remaining = max_expire;

    for idx in 0..kv.num_shards() {
        let shard = kv.shard_at(idx);
        let remaining = shard.ttl(&flag_key).await?;
        match remaining {
            Some(ttl) if ttl > min_expire => {
                min_remaining = min_remaining.min(ttl);
            }
            _ => needs_refresh = true,
        }
    }

    if needs_refresh {
        debug!(key, "refreshing distributed-flag on all shards");
        let sets = (0..kv.num_shards()).map(|idx| {
            let shard = kv.shard_at(idx);
            let flag_key = flag_key.clone();
            async move { shard.set_ex(&flag_key, "1", max_expire).await }
        });
        for result in join_all(sets).await {
            result?;
        }
        min_remaining = max_expire;
    }

    let window = timer_window.max(min_expire).min(min_remaining.saturating_sub(min_expire).max(min_expire));
    let jitter_ms = rand::thread_rng().gen_range(0..=window.as_millis().max(1) as u64);
    let next_check = min_remaining.saturating_sub(min_expire + Duration::from_millis(jitter_ms));
    Ok(next_check.max(Duration::from_millis(1)))
}

/// Whether a prior distributed read recently touched `key`, by checking the flag on shard 0
/// (every shard carries an identical copy; any one suffices to answer the question).
pub async fn distributed_flag_present(kv: &dyn KvClient, prefix: &str, key: &str) -> LockResult<bool> {
    let flag_key = keys::dflag_key(prefix, key);
    Ok(kv.shard_at(0).exists(&flag_key).await?)
}

/// Composite lease over every shard's write handle for one key (§3 DistributedWriteHandle).
pub struct DistributedWriteHandle {
    per_shard: Vec<Arc<Handle>>,
}

impl DistributedWriteHandle {
    pub fn key(&self) -> &str {
        self.per_shard.first().map(|h| h.key()).unwrap_or_default()
    }

    pub fn per_shard(&self) -> &[Arc<Handle>] {
        &self.per_shard
    }

    /// Released iff all per-shard handles released (§3 invariant).
    pub async fn release(&self) -> LockResult<()> {
        for handle in &self.per_shard {
            handle.release().await?;
        }
        Ok(())
    }

    pub async fn force_release(&self) -> LockResult<()> {
        for handle in &self.per_shard {
            handle.force_release().await?;
        }
        Ok(())
    }
}

/// Acquire the key's write lock on every shard, in shard order, sharing one token base so
/// conflict resolution stays consistent across shards (§4.5 paragraph 3). On any per-shard
/// failure, best-effort force-release everything already acquired and propagate the error.
pub async fn acquire_distributed_write(
    kv: &dyn KvClient,
    prefix: &str,
    key: &str,
    tokens: &TokenGenerator,
    options: &LockOptions,
    mut on_warn: impl FnMut(Duration),
) -> LockResult<DistributedWriteHandle> {
    let mut acquired = Vec::with_capacity(kv.num_shards());

    for idx in 0..kv.num_shards() {
        let shard = kv.shard_at(idx);
        let token = tokens.next(options.conflict_priority);

        let result = engine::acquire_write(
            &*shard,
            prefix,
            key,
            &token,
            tokens.base(),
            options,
            &mut on_warn,
        )
        .await;

        match result {
            Ok(()) => {
                acquired.push(Handle::new(
                    key.to_string(),
                    token,
                    Role::Write,
                    prefix.to_string(),
                    ShardRef { shard, shard_index: idx },
                    options,
                ));
            }
            Err(err) => {
                warn!(key, shard = idx, %err, "distributed write acquisition failed, rolling back");
                for handle in &acquired {
                    if let Err(cleanup_err) = handle.force_release().await {
                        warn!(key, %cleanup_err, "rollback of partial distributed write lock failed");
                    }
                }
                return Err(err);
            }
        }
    }

    Ok(DistributedWriteHandle { per_shard: acquired })
}

/// Outcome of a `distributed: "auto"` write acquisition: either a normal single-shard lease or
/// a full distributed one, decided by whether the distributed-flag was already present.
pub enum AutoWriteHandle {
    Single(Arc<Handle>),
    Distributed(DistributedWriteHandle),
}

/// §4.5 paragraph 4: check the flag; if absent, acquire single-shard then re-check (another
/// distributed reader may have appeared mid-acquisition); if present at either check, switch
/// to (or redo as) a full distributed acquisition.
pub async fn acquire_auto_write(
    kv: &dyn KvClient,
    prefix: &str,
    key: &str,
    tokens: &TokenGenerator,
    options: &LockOptions,
    mut on_warn: impl FnMut(Duration),
) -> LockResult<AutoWriteHandle> {
    if distributed_flag_present(kv, prefix, key).await? {
        return acquire_distributed_write(kv, prefix, key, tokens, options, on_warn)
            .await
            .map(AutoWriteHandle::Distributed);
    }

    let shard = kv.shard(crate::kv::ShardSelector::Key(key));
    let token = tokens.next(options.conflict_priority);
    engine::acquire_write(&*shard, prefix, key, &token, tokens.base(), options, &mut on_warn).await?;

    if distributed_flag_present(kv, prefix, key).await? {
        let single = Handle::new(
            key.to_string(),
            token,
            Role::Write,
            prefix.to_string(),
            ShardRef { shard, shard_index: usize::MAX },
            options,
        );
        if let Err(err) = single.force_release().await {
            warn!(key, %err, "failed to release provisional single-shard lock before escalating to distributed");
            return Err(err);
        }
        return acquire_distributed_write(kv, prefix, key, tokens, options, on_warn)
            .await
            .map(AutoWriteHandle::Distributed);
    }

    Ok(AutoWriteHandle::Single(Handle::new(
        key.to_string(),
        token,
        Role::Write,
        prefix.to_string(),
        ShardRef { shard, shard_index: usize::MAX },
        options,
    )))
}

