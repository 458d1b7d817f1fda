//! The acquisition engine (§4.3): the retry loop shared by every read and write acquisition,
//! whether single-shard or one leg of a distributed fan-out.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tracing::{trace, warn};

use crate::error::{KvError, LockError, LockResult, Role};
use crate::keys;
use crate::kv::ShardClient;
use crate::options::LockOptions;
use crate::scripts::{LockScript, ReadAcquireOutcome, WriteAcquireOutcome};
use crate::token::wins_conflict;

const INITIAL_WAIT: Duration = Duration::from_millis(5);
const MAX_WAIT: Duration = Duration::from_millis(1000);

fn ttl_secs(lock_timeout: Option<Duration>) -> u64 {
    lock_timeout.map(|d| d.as_secs().max(1)).unwrap_or(0)
}

/// `waitTime = min(1000ms, 3*prev + rand[0,3))` (§4.3 "Retry scheduling").
fn next_wait(prev: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..3u64);
    let candidate_ms = prev.as_millis() as u64 * 3 + jitter_ms;
    Duration::from_millis(candidate_ms).min(MAX_WAIT)
}

fn resource_locked(
    key: &str,
    role: Role,
    options: &LockOptions,
    token: &str,
    token_base: &str,
    holder: Option<String>,
    holder_changes: u32,
    reason: &'static str,
) -> LockError {
    LockError::ResourceLocked {
        key: key.to_string(),
        role,
        max_wait: options.max_wait_time,
        token: token.to_string(),
        token_base: token_base.to_string(),
        holder,
        holder_changes,
        reason,
    }
}

/// Tracks elapsed wait, next backoff, and a single warn-callback firing across a retry loop.
struct RetryState<'a> {
    wait: Duration,
    elapsed: Duration,
    warned: bool,
    warn_time: Option<Duration>,
    on_warn: &'a mut dyn FnMut(Duration),
}

impl<'a> RetryState<'a> {
    fn new(warn_time: Option<Duration>, on_warn: &'a mut dyn FnMut(Duration)) -> Self {
        Self { wait: INITIAL_WAIT, elapsed: Duration::ZERO, warned: false, warn_time, on_warn }
    }

    fn reset_wait(&mut self) {
        self.wait = INITIAL_WAIT;
    }

    fn timed_out(&self, max_wait_time: Duration) -> bool {
        self.elapsed.as_secs() >= max_wait_time.as_secs()
    }

    /// Fires the warn callback at most once, then sleeps for the current backoff and advances
    /// it. Does not touch `elapsed` beyond adding the sleep duration.
    async fn wait_and_advance(&mut self) {
        if let Some(threshold) = self.warn_time {
            if !self.warned && self.elapsed >= threshold {
                self.warned = true;
                (self.on_warn)(self.elapsed);
            }
        }
        tokio::time::sleep(self.wait).await;
        self.elapsed += self.wait;
        self.wait = next_wait(self.wait);
    }
}

/// Best-effort cleanup of a write claim abandoned mid-drain (§4.3 step 5, §9 Open Questions:
/// also run this when a claim is abandoned due to conflict-resolution loss).
async fn cleanup_claim(shard: &dyn ShardClient, write_key: &str, token: &str) {
    if let Err(err) = shard
        .run_script(LockScript::WriteLockRelease, &[write_key], &[token.to_string()])
        .await
    {
        warn!(%err, write_key, "best-effort cleanup of abandoned write claim failed");
    }
}

/// Acquire a read lease for `key` on the given shard (§4.3 "Read acquisition").
pub async fn acquire_read(
    shard: &dyn ShardClient,
    prefix: &str,
    key: &str,
    token: &str,
    token_base: &str,
    options: &LockOptions,
    mut on_warn: impl FnMut(Duration),
) -> LockResult<()> {
    let write_k = keys::write_key(prefix, key);
    let read_k = keys::read_key(prefix, key);
    let ttl = ttl_secs(options.lock_timeout);

    let mut retry = RetryState::new(options.warn_time, &mut on_warn);
    let mut holder: Option<String> = None;
    let mut holder_changes = 0u32;

    loop {
        let attempt = shard
            .run_script(
                LockScript::ReadLockAcquire,
                &[&write_k, &read_k],
                &[token.to_string(), ttl.to_string()],
            )
            .await;

        let reply = match attempt {
            Ok(reply) => reply,
            Err(err) if matches!(err, KvError::ShardUnavailable(_)) => {
                trace!(key, "shard unavailable during read acquire, retrying");
                retry.wait_and_advance().await;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match ReadAcquireOutcome::try_from(reply).map_err(LockError::from)? {
            ReadAcquireOutcome::Acquired { .. } => return Ok(()),
            ReadAcquireOutcome::Conflict { holder: new_holder } => {
                if holder.as_deref().is_some_and(|h| h != new_holder) {
                    holder_changes += 1;
                    retry.reset_wait();
                }
                holder = Some(new_holder);

                if options.max_wait_time.is_zero() {
                    return Err(resource_locked(
                        key, Role::Read, options, token, token_base, holder, holder_changes, "zero wait",
                    ));
                }
                if retry.timed_out(options.max_wait_time) {
                    return Err(resource_locked(
                        key, Role::Read, options, token, token_base, holder, holder_changes, "timeout",
                    ));
                }
                retry.wait_and_advance().await;
            }
        }
    }
}

/// Acquire a write lease for `key` on the given shard (§4.3 "Write acquisition").
pub async fn acquire_write(
    shard: &dyn ShardClient,
    prefix: &str,
    key: &str,
    token: &str,
    token_base: &str,
    options: &LockOptions,
    mut on_warn: impl FnMut(Duration),
) -> LockResult<()> {
    let write_k = keys::write_key(prefix, key);
    let read_k = keys::read_key(prefix, key);
    let ttl = ttl_secs(options.lock_timeout);

    let mut retry = RetryState::new(options.warn_time, &mut on_warn);
    let mut claimed = false;
    let mut conflict_holder: Option<String> = None;
    let mut holder_changes = 0u32;
    let mut drain_members: Option<HashSet<String>> = None;

    loop {
        let script = if claimed { LockScript::WriteLockRetry } else { LockScript::WriteLockAcquire };
        let attempt = shard
            .run_script(script, &[&write_k, &read_k], &[token.to_string(), ttl.to_string()])
            .await;

        let reply = match attempt {
            Ok(reply) => reply,
            Err(err) if matches!(err, KvError::ShardUnavailable(_)) => {
                trace!(key, "shard unavailable during write acquire, retrying");
                retry.wait_and_advance().await;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match WriteAcquireOutcome::try_from(reply).map_err(LockError::from)? {
            WriteAcquireOutcome::Acquired => return Ok(()),

            WriteAcquireOutcome::ClaimedPendingDrain { members } => {
                claimed = true;
                let members_set: HashSet<String> = members.into_iter().collect();
                if drain_members.as_ref().is_some_and(|prev| *prev != members_set) {
                    holder_changes += 1;
                    retry.reset_wait();
                }
                drain_members = Some(members_set);

                if options.max_wait_time.is_zero() {
                    cleanup_claim(shard, &write_k, token).await;
                    return Err(resource_locked(
                        key, Role::Write, options, token, token_base, None, holder_changes, "zero wait",
                    ));
                }
                if retry.timed_out(options.max_wait_time) {
                    cleanup_claim(shard, &write_k, token).await;
                    return Err(resource_locked(
                        key, Role::Write, options, token, token_base, None, holder_changes, "timeout",
                    ));
                }
                retry.wait_and_advance().await;
            }

            WriteAcquireOutcome::Conflict { holder: new_holder } => {
                if conflict_holder.as_deref().is_some_and(|h| h != new_holder) {
                    holder_changes += 1;
                    retry.reset_wait();
                }
                conflict_holder = Some(new_holder.clone());

                if options.resolve_conflicts && !wins_conflict(token, &new_holder) {
                    if claimed {
                        cleanup_claim(shard, &write_k, token).await;
                    }
                    return Err(resource_locked(
                        key,
                        Role::Write,
                        options,
                        token,
                        token_base,
                        Some(new_holder),
                        holder_changes,
                        "conflict resolution",
                    ));
                }
                claimed = false;
                drain_members = None;

                if options.max_wait_time.is_zero() {
                    return Err(resource_locked(
                        key, Role::Write, options, token, token_base, conflict_holder, holder_changes, "zero wait",
                    ));
                }
                if retry.timed_out(options.max_wait_time) {
                    return Err(resource_locked(
                        key, Role::Write, options, token, token_base, conflict_holder, holder_changes, "timeout",
                    ));
                }
                retry.wait_and_advance().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_one_second() {
        let mut wait = INITIAL_WAIT;
        for _ in 0..20 {
            wait = next_wait(wait);
        }
        assert!(wait <= MAX_WAIT);
    }

    #[test]
    fn backoff_grows_from_initial() {
        let grown = next_wait(INITIAL_WAIT);
        assert!(grown >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn zero_max_wait_fails_fast_without_sleep() {
        use crate::kv::{InMemoryKvClient, KvClient, ShardSelector};

        let client = InMemoryKvClient::new(1);
        let shard = client.shard(ShardSelector::Key("shared"));
        let write_k = keys::write_key("", "shared");
        let read_k = keys::read_key("", "shared");

        shard
            .run_script(LockScript::WriteLockAcquire, &[&write_k, &read_k], &["holder".to_string(), "0".to_string()])
            .await
            .unwrap();

        let mut options = LockOptions::default();
        options.max_wait_time = Duration::ZERO;

        let start = tokio::time::Instant::now();
        let err = acquire_write(&*shard, "", "shared", "contender", "base", &options, |_| {})
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(50));
        match err {
            LockError::ResourceLocked { reason, .. } => assert_eq!(reason, "zero wait"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
