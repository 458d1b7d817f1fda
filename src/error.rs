//! Error types for the lock engine and its KV client contract.

use thiserror::Error;

/// Errors surfaced by a KV client implementation (§6 external collaborator contract).
///
/// `ShardUnavailable` is distinguished from every other variant because the acquisition
/// engine treats it specially: a transient miss during acquisition (keep retrying until the
/// deadline), but a suppressible error during release (§4.7).
#[derive(Error, Debug)]
pub enum KvError {
    /// The shard is known-down within its grace period (`downNodeExpiry`). Acquisition treats
    /// this as a retryable miss; release swallows it.
    #[error("shard unavailable: {0}")]
    ShardUnavailable(String),

    /// Underlying Redis transport or protocol error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failure encoding/decoding a script reply or debug-token payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Script registration or lookup failed (script-registration machinery is an external
    /// collaborator, but a client must still be able to report that it's missing a script).
    #[error("script not registered: {0}")]
    ScriptNotRegistered(String),
}

impl KvError {
    /// Whether this error is suppressible during a release path (§4.7, §9 Open Questions).
    ///
    /// Only shard-unavailable and the subset of Redis errors the client categorizes as
    /// transport-layer (connection refused/reset/timeout) are suppressible. Script logic
    /// errors, serialization errors, and anything else must propagate.
    pub fn is_benign_on_release(&self) -> bool {
        match self {
            KvError::ShardUnavailable(_) => true,
            KvError::Redis(e) => e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout(),
            KvError::Serialization(_) | KvError::ScriptNotRegistered(_) => false,
        }
    }
}

/// Result alias for KV client operations.
pub type KvResult<T> = Result<T, KvError>;

/// The role a handle was acquired under, carried in diagnostic errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Shared read lease.
    Read,
    /// Exclusive write lease.
    Write,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Read => write!(f, "read"),
            Role::Write => write!(f, "write"),
        }
    }
}

/// Top-level error type for the lock engine (§7).
#[derive(Error, Debug)]
pub enum LockError {
    /// Acquisition gave up: timeout, zero-wait miss, or conflict-resolution loss.
    #[error(
        "A lock cannot be acquired on the resource: {key} ({reason}, role={role}, max_wait={max_wait:?}, \
         token={token}, token_base={token_base}, holder={holder:?}, holder_changes={holder_changes})"
    )]
    ResourceLocked {
        /// Key the caller tried to lock.
        key: String,
        /// Read or write.
        role: Role,
        /// Configured ceiling for this acquisition.
        max_wait: std::time::Duration,
        /// This acquisition's own token.
        token: String,
        /// This locker's token base.
        token_base: String,
        /// Last observed holder token, if any.
        holder: Option<String>,
        /// Number of times the observed holder changed while waiting.
        holder_changes: u32,
        /// Short human reason: "timeout", "conflict resolution", or "zero wait".
        reason: &'static str,
    },

    /// Caller misuse: duplicate key in `addLock`, upgrade on a released handle, non-sequence
    /// of keys passed to a bulk operation, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An invariant was violated: a write handle without a token, relock after release.
    #[error("internal error: {0}")]
    Internal(String),

    /// Propagated from the KV client contract.
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Result alias for lock engine operations.
pub type LockResult<T> = Result<T, LockError>;
