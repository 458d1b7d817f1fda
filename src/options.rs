//! Recognized options and locker-level defaults (§6).

use std::time::Duration;

/// Distributed-mode tri-state (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distributed {
    /// Normal single-shard (key-addressed) locking.
    #[default]
    Off,
    /// Reads pick a random shard; writes fan out to every shard.
    On,
    /// Writes consult the distributed-flag to decide between `Off` and `On` behavior.
    Auto,
}

/// Error policy for `LockSet::upgrade` and `Handle::upgrade` (§4.4, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Rethrow immediately at the first failure.
    #[default]
    Stop,
    /// Release everything (the whole set, or just this handle) before rethrowing.
    Release,
    /// Collect failures and return them instead of rethrowing (only meaningful for
    /// `LockSet::upgrade`; `Handle::upgrade` has nothing to collect into).
    Ignore,
}

/// Per-acquisition options (§6 "Recognized options").
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// TTL applied to KV entries; `None` means no expiry (lockTimeout = 0).
    pub lock_timeout: Option<Duration>,
    /// Acquisition ceiling; `Some(Duration::ZERO)` means fail fast after the first miss.
    pub max_wait_time: Duration,
    /// Governs how long a known-down shard is still reported as "shard unavailable" by the
    /// KV client, rather than a hard error.
    pub down_node_expiry: Duration,
    /// Heartbeat period override. `None` disables heartbeats entirely.
    pub heartbeat_interval: Option<Duration>,
    /// TTL written by each heartbeat tick.
    pub heartbeat_timeout: Duration,
    /// Elapsed-wait threshold for a single warn callback. `None` disables the callback.
    pub warn_time: Option<Duration>,
    /// Enable deterministic loser short-circuit between competing writers.
    pub resolve_conflicts: bool,
    /// Per-request priority (0-99, lower wins conflicts).
    pub conflict_priority: u8,
    /// Override the per-process token base (lock sets use this so all writers in a set share
    /// conflict-resolution identity).
    pub token_base: Option<String>,
    /// Writer/reader shard distribution mode.
    pub distributed: Distributed,
    /// On reads, maintain the distributed-flag so `Distributed::Auto` writers can detect
    /// recent distributed-read activity.
    pub enable_distributed_auto: bool,
    /// Error policy for upgrade.
    pub on_error: OnError,
}

impl LockOptions {
    /// The heartbeat interval actually used: the override if set, else one third of the lock
    /// timeout (§4.4), or disabled entirely if heartbeats are off or there's no TTL to refresh.
    pub fn effective_heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval {
            Some(d) => Some(d),
            None => self
                .lock_timeout
                .map(|t| Duration::from_millis((t.as_millis() as u64) / 3).max(Duration::from_millis(1))),
        }
    }

    /// The TTL a heartbeat tick writes: the override if set, else derived from the interval
    /// (`ceil(3 * interval)` in seconds, per §4.4's default relationship).
    pub fn effective_heartbeat_timeout(&self, interval: Duration) -> Duration {
        if self.heartbeat_timeout > Duration::ZERO {
            self.heartbeat_timeout
        } else {
            let secs = (3 * interval.as_millis() as u64).div_ceil(1000);
            Duration::from_secs(secs.max(1))
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Some(Duration::from_secs(60)),
            max_wait_time: Duration::from_secs(86_400),
            down_node_expiry: Duration::from_secs(60),
            heartbeat_interval: None,
            heartbeat_timeout: Duration::ZERO,
            warn_time: None,
            resolve_conflicts: false,
            conflict_priority: 50,
            token_base: None,
            distributed: Distributed::Off,
            enable_distributed_auto: true,
            on_error: OnError::Stop,
        }
    }
}

/// Locker-wide defaults and knobs that are not per-acquisition (§6, §8).
#[derive(Debug, Clone)]
pub struct LockerConfig {
    /// KV key prefix, default `"rzlock:"`.
    pub key_prefix: String,
    /// Embed per-token diagnostics (locker id, pid) after a debug sentinel.
    pub debug_tokens: bool,
    /// Floor below which a distributed-flag is considered "expiring soon" and renewed.
    pub min_distributed_lock_flag_expire: Duration,
    /// TTL written when a distributed-flag is (re)set.
    pub max_distributed_lock_flag_expire: Duration,
    /// Window used to bias the next distributed-flag check toward later times.
    pub distributed_lock_flag_timer_window: Duration,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rzlock:".to_string(),
            debug_tokens: false,
            min_distributed_lock_flag_expire: Duration::from_secs(5),
            max_distributed_lock_flag_expire: Duration::from_secs(60),
            distributed_lock_flag_timer_window: Duration::from_secs(15),
        }
    }
}
