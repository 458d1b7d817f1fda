//! The KV client contract (§6) and its two implementations: a Redis-backed client for
//! production use, and an in-memory double for deterministic tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::{KvError, KvResult};
use crate::scripts::{decode_redis_reply, LockScript, ScriptReply};

/// How a caller picks a shard: by key (hashed) or by explicit index (used by `distributed.rs`'s
/// write fan-out and random-read selection, which already know which shard they want).
#[derive(Debug, Clone, Copy)]
pub enum ShardSelector<'a> {
    Key(&'a str),
    Index(usize),
}

/// Top-level KV client: owns the shard topology and dispatches to the shard that should serve
/// a given key (§4.5's "single-shard" addressing; `distributed.rs` bypasses this for random/
/// fan-out addressing by calling `shard_at` directly).
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Number of shards in the topology. Always >= 1.
    fn num_shards(&self) -> usize;

    /// Resolve a selector to a shard handle.
    fn shard(&self, selector: ShardSelector<'_>) -> Arc<dyn ShardClient>;

    /// Resolve a shard by index directly (0-based), for callers that already picked one.
    fn shard_at(&self, index: usize) -> Arc<dyn ShardClient> {
        self.shard(ShardSelector::Index(index))
    }

    /// Pre-load every atomic script into each shard's script cache via `SCRIPT LOAD`. Purely a
    /// warm-up for the server-side cache; `run_script` itself always sends the script body with
    /// `EVAL`, so a client that skips this still behaves identically, just without having
    /// pre-primed the cache.
    async fn ensure_scripts_registered(&self) -> KvResult<()> {
        for idx in 0..self.num_shards() {
            self.shard_at(idx).register_scripts().await?;
        }
        Ok(())
    }
}

/// Per-shard operations (§6). Every method maps to exactly one KV round trip.
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Run one of the atomic lock scripts against this shard.
    async fn run_script(
        &self,
        script: LockScript,
        keys: &[&str],
        args: &[String],
    ) -> KvResult<ScriptReply>;

    /// Whether `key` currently exists (used by the distributed-flag check, §4.5).
    async fn exists(&self, key: &str) -> KvResult<bool>;

    /// Remaining TTL on `key`, if it has one and exists.
    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;

    /// Set `key` to `value` with the given TTL (used to (re)set the distributed-flag).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Delete `key` unconditionally.
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Pre-load all atomic scripts on this shard. Default no-op for backends (like the
    /// in-memory double) that have no script cache to warm.
    async fn register_scripts(&self) -> KvResult<()> {
        Ok(())
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------------------------
// Redis-backed client
// ---------------------------------------------------------------------------------------------

/// One shard's worth of connection state. Wraps `ConnectionManager`, which already reconnects
/// transparently on transport errors, so `ShardClient` only has to translate errors into
/// `KvError::ShardUnavailable` when the manager reports the node as currently unreachable.
struct RedisShard {
    manager: AsyncMutex<ConnectionManager>,
    down_node_expiry: Duration,
    down_since: AtomicUsize,
}

impl RedisShard {
    fn note_outcome(&self, ok: bool) {
        if ok {
            self.down_since.store(0, Ordering::Relaxed);
        } else if self.down_since.load(Ordering::Relaxed) == 0 {
            self.down_since.store(now_secs(), Ordering::Relaxed);
        }
    }

    fn classify(&self, err: redis::RedisError) -> KvError {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            self.note_outcome(false);
            let down_for = self.down_since.load(Ordering::Relaxed);
            if down_for != 0 && now_secs().saturating_sub(down_for) < self.down_node_expiry.as_secs() as usize {
                return KvError::ShardUnavailable(err.to_string());
            }
        } else {
            self.note_outcome(true);
        }
        KvError::Redis(err)
    }
}

fn now_secs() -> usize {
    // Monotonic-enough counter for the down-node grace window; we only ever compare deltas.
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs() as usize
}

#[async_trait]
impl ShardClient for RedisShard {
    async fn run_script(
        &self,
        script: LockScript,
        keys: &[&str],
        args: &[String],
    ) -> KvResult<ScriptReply> {
        let mut conn = self.manager.lock().await;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script.lua()).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        let value: redis::Value = cmd.query_async(&mut *conn).await.map_err(|e| self.classify(e))?;
        self.note_outcome(true);
        debug!(script = script.name(), ?keys, "ran lock script");
        decode_redis_reply(value)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.manager.lock().await;
        let n: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| self.classify(e))?;
        self.note_outcome(true);
        Ok(n == 1)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let mut conn = self.manager.lock().await;
        let secs: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| self.classify(e))?;
        self.note_outcome(true);
        Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.manager.lock().await;
        let secs = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs)
            .query_async(&mut *conn)
            .await
            .map_err(|e| self.classify(e))?;
        self.note_outcome(true);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.manager.lock().await;
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| self.classify(e))?;
        self.note_outcome(true);
        Ok(())
    }

    async fn register_scripts(&self) -> KvResult<()> {
        let mut conn = self.manager.lock().await;
        for script in LockScript::ALL {
            let _: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(script.lua())
                .query_async(&mut *conn)
                .await
                .map_err(|e| self.classify(e))?;
        }
        Ok(())
    }
}

/// Redis-backed `KvClient` over a fixed list of shard addresses.
pub struct RedisKvClient {
    shards: Vec<Arc<RedisShard>>,
}

impl RedisKvClient {
    /// Connect to every shard address (each a `redis://` URL), in order. Shard index 0 is the
    /// first address given.
    pub async fn connect(addrs: &[String], down_node_expiry: Duration) -> KvResult<Self> {
        let mut shards = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let client = redis::Client::open(addr.as_str())?;
            let manager = ConnectionManager::new(client).await?;
            shards.push(Arc::new(RedisShard {
                manager: AsyncMutex::new(manager),
                down_node_expiry,
                down_since: AtomicUsize::new(0),
            }));
        }
        Ok(Self { shards })
    }
}

#[async_trait]
impl KvClient for RedisKvClient {
    fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, selector: ShardSelector<'_>) -> Arc<dyn ShardClient> {
        let idx = match selector {
            ShardSelector::Index(i) => i % self.shards.len().max(1),
            ShardSelector::Key(key) => (hash_key(key) as usize) % self.shards.len().max(1),
        };
        self.shards[idx].clone()
    }
}

// ---------------------------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------------------------

#[derive(Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Clone)]
struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

/// Reimplements each atomic script's semantics directly in Rust over `DashMap`s, the same way
/// a test double stands in for a Lua-evaluating server: same observable outcomes, no network.
struct InMemoryShard {
    strings: DashMap<String, StringEntry>,
    sets: DashMap<String, SetEntry>,
    /// Artificial unavailability, toggled by tests exercising `ShardUnavailable` handling.
    down: std::sync::atomic::AtomicBool,
}

impl InMemoryShard {
    fn new() -> Self {
        Self {
            strings: DashMap::new(),
            sets: DashMap::new(),
            down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn check_down(&self) -> KvResult<()> {
        if self.down.load(Ordering::Relaxed) {
            return Err(KvError::ShardUnavailable("shard marked down by test".to_string()));
        }
        Ok(())
    }

    fn get_string(&self, key: &str) -> Option<String> {
        let expired = self
            .strings
            .get(key)
            .map(|e| e.expires_at.is_some_and(|t| t <= Instant::now()))
            .unwrap_or(false);
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|e| e.value.clone())
    }

    fn set_string(&self, key: &str, value: &str, ttl_secs: u64) {
        let expires_at = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));
        self.strings.insert(key.to_string(), StringEntry { value: value.to_string(), expires_at });
    }

    fn del_string(&self, key: &str) {
        self.strings.remove(key);
    }

    fn members(&self, key: &str) -> Vec<String> {
        let expired = self
            .sets
            .get(key)
            .map(|e| e.expires_at.is_some_and(|t| t <= Instant::now()))
            .unwrap_or(false);
        if expired {
            self.sets.remove(key);
            return Vec::new();
        }
        self.sets
            .get(key)
            .map(|e| e.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn sadd(&self, key: &str, value: &str, ttl_secs: u64) {
        let mut entry = self.sets.entry(key.to_string()).or_insert_with(|| SetEntry {
            members: HashSet::new(),
            expires_at: None,
        });
        entry.members.insert(value.to_string());
        if ttl_secs > 0 {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
    }

    fn srem(&self, key: &str, value: &str) {
        if let Some(mut entry) = self.sets.get_mut(key) {
            entry.members.remove(value);
        }
    }

    fn sismember(&self, key: &str, value: &str) -> bool {
        self.members(key).iter().any(|m| m == value)
    }

    fn expire_set(&self, key: &str, ttl_secs: u64) {
        if let Some(mut entry) = self.sets.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
    }
}

#[async_trait]
impl ShardClient for InMemoryShard {
    async fn run_script(
        &self,
        script: LockScript,
        keys: &[&str],
        args: &[String],
    ) -> KvResult<ScriptReply> {
        self.check_down()?;
        let ttl_secs = || args.get(1).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        let reply = match script {
            LockScript::ReadLockAcquire => {
                let (write_key, read_key) = (keys[0], keys[1]);
                let token = &args[0];
                match self.get_string(write_key) {
                    Some(holder) => ScriptReply::new(0, Some(holder), vec![]),
                    None => {
                        self.sadd(read_key, token, ttl_secs());
                        ScriptReply::new(1, None, vec![])
                    }
                }
            }
            LockScript::WriteLockAcquire => {
                let (write_key, read_key) = (keys[0], keys[1]);
                let token = &args[0];
                match self.get_string(write_key) {
                    Some(holder) => ScriptReply::new(0, Some(holder), vec![]),
                    None => {
                        self.set_string(write_key, token, ttl_secs());
                        let members = self.members(read_key);
                        if members.is_empty() {
                            ScriptReply::new(1, None, vec![])
                        } else {
                            ScriptReply::new(2, None, members)
                        }
                    }
                }
            }
            LockScript::WriteLockRetry => {
                let (write_key, read_key) = (keys[0], keys[1]);
                let token = &args[0];
                let current = self.get_string(write_key);
                if current.is_none() || current.as_deref() == Some(token.as_str()) {
                    self.set_string(write_key, token, ttl_secs());
                    let members = self.members(read_key);
                    if members.is_empty() {
                        ScriptReply::new(1, None, vec![])
                    } else {
                        ScriptReply::new(2, None, members)
                    }
                } else {
                    ScriptReply::new(0, current, vec![])
                }
            }
            LockScript::ReadLockRelease => {
                let read_key = keys[0];
                let token = &args[0];
                self.srem(read_key, token);
                ScriptReply::new(1, None, self.members(read_key))
            }
            LockScript::WriteLockRelease => {
                let write_key = keys[0];
                let token = &args[0];
                if self.get_string(write_key).as_deref() == Some(token.as_str()) {
                    self.del_string(write_key);
                    ScriptReply::new(1, None, vec![])
                } else {
                    ScriptReply::new(0, None, vec![])
                }
            }
            LockScript::ReadLockHeartbeat => {
                let read_key = keys[0];
                let token = &args[0];
                if self.sismember(read_key, token) {
                    if ttl_secs() > 0 {
                        self.expire_set(read_key, ttl_secs());
                    }
                    ScriptReply::new(1, None, vec![])
                } else {
                    ScriptReply::new(3, None, vec![])
                }
            }
            LockScript::WriteLockHeartbeat => {
                let write_key = keys[0];
                let token = &args[0];
                match self.get_string(write_key) {
                    Some(ref cur) if cur == token => {
                        if ttl_secs() > 0 {
                            self.set_string(write_key, token, ttl_secs());
                        }
                        ScriptReply::new(1, None, vec![])
                    }
                    Some(other) => ScriptReply::new(0, Some(other), vec![]),
                    None => ScriptReply::new(3, None, vec![]),
                }
            }
        };
        Ok(reply)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.check_down()?;
        Ok(self.get_string(key).is_some())
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        self.check_down()?;
        Ok(self.strings.get(key).and_then(|e| {
            e.expires_at.map(|t| t.saturating_duration_since(Instant::now()))
        }))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.check_down()?;
        self.set_string(key, value, ttl.as_secs().max(1));
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.check_down()?;
        self.del_string(key);
        Ok(())
    }
}

/// In-process `KvClient` double backed by `DashMap`s instead of a live Redis deployment.
/// Grounded directly in the corpus's own habit of reimplementing a Lua script's semantics in
/// Rust for a test double rather than spinning up a real server.
pub struct InMemoryKvClient {
    shards: Vec<Arc<InMemoryShard>>,
}

impl InMemoryKvClient {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1)).map(|_| Arc::new(InMemoryShard::new())).collect();
        Self { shards }
    }

    /// Test hook: force a shard to report `ShardUnavailable` until un-downed.
    pub fn set_shard_down(&self, index: usize, down: bool) {
        if let Some(shard) = self.shards.get(index) {
            shard.down.store(down, Ordering::Relaxed);
            if down {
                warn!(shard = index, "test double marking shard down");
            }
        }
    }
}

#[async_trait]
impl KvClient for InMemoryKvClient {
    fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, selector: ShardSelector<'_>) -> Arc<dyn ShardClient> {
        let idx = match selector {
            ShardSelector::Index(i) => i % self.shards.len(),
            ShardSelector::Key(key) => (hash_key(key) as usize) % self.shards.len(),
        };
        self.shards[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_then_write_conflicts_and_drains() {
        let client = InMemoryKvClient::new(1);
        let shard = client.shard(ShardSelector::Key("k"));

        let r = shard
            .run_script(LockScript::ReadLockAcquire, &["wk", "rk"], &["reader-1".to_string(), "0".to_string()])
            .await
            .unwrap();
        assert_eq!(r.code, 1);

        let w = shard
            .run_script(LockScript::WriteLockAcquire, &["wk", "rk"], &["writer-1".to_string(), "0".to_string()])
            .await
            .unwrap();
        assert_eq!(w.code, 2);
        assert_eq!(w.members, vec!["reader-1".to_string()]);

        let release = shard
            .run_script(LockScript::ReadLockRelease, &["rk"], &["reader-1".to_string()])
            .await
            .unwrap();
        assert_eq!(release.code, 1);
        assert!(release.members.is_empty());
    }

    #[tokio::test]
    async fn write_release_rejects_wrong_token() {
        let client = InMemoryKvClient::new(1);
        let shard = client.shard(ShardSelector::Key("k"));
        shard
            .run_script(LockScript::WriteLockAcquire, &["wk", "rk"], &["writer-1".to_string(), "0".to_string()])
            .await
            .unwrap();

        let bad = shard
            .run_script(LockScript::WriteLockRelease, &["wk"], &["writer-2".to_string()])
            .await
            .unwrap();
        assert_eq!(bad.code, 0);

        let good = shard
            .run_script(LockScript::WriteLockRelease, &["wk"], &["writer-1".to_string()])
            .await
            .unwrap();
        assert_eq!(good.code, 1);
    }

    #[tokio::test]
    async fn down_shard_reports_unavailable() {
        let client = InMemoryKvClient::new(1);
        client.set_shard_down(0, true);
        let shard = client.shard(ShardSelector::Index(0));
        let err = shard.exists("anything").await.unwrap_err();
        assert!(err.is_benign_on_release());
    }
}
