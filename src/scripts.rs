//! The atomic lock scripts (§4.1).
//!
//! Each routine below is a server-evaluated, single-round-trip primitive over the two keys
//! that back one lock name: a write-slot (a plain string) and a read-set (a set of holder
//! tokens). Every script returns a uniform 3-element reply — `[code, holder_or_empty,
//! members]` — so `ScriptReply` can decode any of them the same way. Outcome codes are the
//! ones from §4.1: `0` not-acquired-due-to-conflict, `1` success, `2` claimed-pending-drain,
//! `3` lost.

use crate::error::{KvError, KvResult};

/// Identifies which of the eight atomic routines a `ShardClient::run_script` call should run.
/// The Redis-backed client maps each variant to Lua text; the in-memory test double matches
/// on it directly and reproduces the same semantics in Rust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScript {
    ReadLockAcquire,
    WriteLockAcquire,
    WriteLockRetry,
    ReadLockRelease,
    WriteLockRelease,
    ReadLockHeartbeat,
    WriteLockHeartbeat,
}

impl LockScript {
    /// The Lua source for this routine, used by the Redis-backed client.
    pub fn lua(self) -> &'static str {
        match self {
            LockScript::ReadLockAcquire => READ_LOCK_ACQUIRE,
            LockScript::WriteLockAcquire => WRITE_LOCK_ACQUIRE,
            LockScript::WriteLockRetry => WRITE_LOCK_RETRY,
            LockScript::ReadLockRelease => READ_LOCK_RELEASE,
            LockScript::WriteLockRelease => WRITE_LOCK_RELEASE,
            LockScript::ReadLockHeartbeat => READ_LOCK_HEARTBEAT,
            LockScript::WriteLockHeartbeat => WRITE_LOCK_HEARTBEAT,
        }
    }

    /// Stable name, used for logging and for `SCRIPT LOAD` pre-warming.
    pub fn name(self) -> &'static str {
        match self {
            LockScript::ReadLockAcquire => "readLockAcquire",
            LockScript::WriteLockAcquire => "writeLockAcquire",
            LockScript::WriteLockRetry => "writeLockRetry",
            LockScript::ReadLockRelease => "readLockRelease",
            LockScript::WriteLockRelease => "writeLockRelease",
            LockScript::ReadLockHeartbeat => "readLockHeartbeat",
            LockScript::WriteLockHeartbeat => "writeLockHeartbeat",
        }
    }

    /// All routines, for pre-warming a shard's script cache.
    pub const ALL: [LockScript; 7] = [
        LockScript::ReadLockAcquire,
        LockScript::WriteLockAcquire,
        LockScript::WriteLockRetry,
        LockScript::ReadLockRelease,
        LockScript::WriteLockRelease,
        LockScript::ReadLockHeartbeat,
        LockScript::WriteLockHeartbeat,
    ];
}

const READ_LOCK_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    local holder = redis.call('GET', KEYS[1])
    return {0, holder, {}}
else
    redis.call('SADD', KEYS[2], ARGV[1])
    if tonumber(ARGV[2]) > 0 then
        redis.call('EXPIRE', KEYS[2], ARGV[2])
    end
    return {1, '', redis.call('SMEMBERS', KEYS[2])}
end
"#;

const WRITE_LOCK_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return {0, redis.call('GET', KEYS[1]), {}}
else
    redis.call('SET', KEYS[1], ARGV[1])
    if tonumber(ARGV[2]) > 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[2])
    end
    local members = redis.call('SMEMBERS', KEYS[2])
    if #members > 0 then
        return {2, '', members}
    else
        return {1, '', {}}
    end
end
"#;

const WRITE_LOCK_RETRY: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == false or cur == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1])
    if tonumber(ARGV[2]) > 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[2])
    end
    local members = redis.call('SMEMBERS', KEYS[2])
    if #members > 0 then
        return {2, '', members}
    else
        return {1, '', {}}
    end
else
    return {0, cur, {}}
end
"#;

const READ_LOCK_RELEASE: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
return {1, '', redis.call('SMEMBERS', KEYS[1])}
"#;

const WRITE_LOCK_RELEASE: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return {1, '', {}}
else
    return {0, '', {}}
end
"#;

const READ_LOCK_HEARTBEAT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
    if tonumber(ARGV[2]) > 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[2])
    end
    return {1, '', {}}
else
    return {3, '', {}}
end
"#;

const WRITE_LOCK_HEARTBEAT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == ARGV[1] then
    if tonumber(ARGV[2]) > 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[2])
    end
    return {1, '', {}}
elseif cur == false then
    return {3, '', {}}
else
    return {0, cur, {}}
end
"#;

/// The decoded, backend-agnostic reply of any atomic script: an outcome code, an optional
/// holder token (empty string means none), and a member list (empty unless the script reports
/// read-set contents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReply {
    pub code: i64,
    pub holder: Option<String>,
    pub members: Vec<String>,
}

impl ScriptReply {
    pub fn new(code: i64, holder: Option<String>, members: Vec<String>) -> Self {
        Self { code, holder, members }
    }
}

/// Outcome of a read-lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadAcquireOutcome {
    /// A writer holds the slot; acquisition must retry.
    Conflict { holder: String },
    /// Token was added to the read-set.
    Acquired { members: Vec<String> },
}

impl TryFrom<ScriptReply> for ReadAcquireOutcome {
    type Error = KvError;

    fn try_from(reply: ScriptReply) -> Result<Self, Self::Error> {
        match reply.code {
            0 => Ok(ReadAcquireOutcome::Conflict {
                holder: reply.holder.unwrap_or_default(),
            }),
            1 => Ok(ReadAcquireOutcome::Acquired { members: reply.members }),
            other => Err(unexpected_code("readLockAcquire", other)),
        }
    }
}

/// Outcome of a write-lock acquire/retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAcquireOutcome {
    /// Another writer holds the slot.
    Conflict { holder: String },
    /// Claimed the slot, but readers are still draining.
    ClaimedPendingDrain { members: Vec<String> },
    /// Fully acquired: slot claimed and no readers remain.
    Acquired,
}

impl TryFrom<ScriptReply> for WriteAcquireOutcome {
    type Error = KvError;

    fn try_from(reply: ScriptReply) -> Result<Self, Self::Error> {
        match reply.code {
            0 => Ok(WriteAcquireOutcome::Conflict {
                holder: reply.holder.unwrap_or_default(),
            }),
            1 => Ok(WriteAcquireOutcome::Acquired),
            2 => Ok(WriteAcquireOutcome::ClaimedPendingDrain { members: reply.members }),
            other => Err(unexpected_code("writeLockAcquire/Retry", other)),
        }
    }
}

/// Outcome of a release script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Whether this call actually removed the caller's own token.
    pub removed: bool,
    /// Read-set members remaining (release of a read lock only).
    pub remaining: Vec<String>,
}

impl TryFrom<ScriptReply> for ReleaseOutcome {
    type Error = KvError;

    fn try_from(reply: ScriptReply) -> Result<Self, Self::Error> {
        match reply.code {
            0 => Ok(ReleaseOutcome { removed: false, remaining: reply.members }),
            1 => Ok(ReleaseOutcome { removed: true, remaining: reply.members }),
            other => Err(unexpected_code("lockRelease", other)),
        }
    }
}

/// Outcome of a heartbeat script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Still the holder; TTL refreshed.
    Alive,
    /// Slot is held by somebody else now.
    Superseded,
    /// Lost: the slot/set no longer contains our token.
    Lost,
}

impl TryFrom<ScriptReply> for HeartbeatOutcome {
    type Error = KvError;

    fn try_from(reply: ScriptReply) -> Result<Self, Self::Error> {
        match reply.code {
            0 => Ok(HeartbeatOutcome::Superseded),
            1 => Ok(HeartbeatOutcome::Alive),
            3 => Ok(HeartbeatOutcome::Lost),
            other => Err(unexpected_code("lockHeartbeat", other)),
        }
    }
}

fn unexpected_code(script: &str, code: i64) -> KvError {
    KvError::ScriptNotRegistered(format!("{script} returned unexpected outcome code {code}"))
}

/// Decode a raw Redis reply value into a `ScriptReply`.
pub fn decode_redis_reply(value: redis::Value) -> KvResult<ScriptReply> {
    use redis::Value;

    let items = match value {
        Value::Bulk(items) => items,
        other => {
            return Err(KvError::ScriptNotRegistered(format!(
                "expected a 3-element array reply, got {other:?}"
            )))
        }
    };

    if items.len() != 3 {
        return Err(KvError::ScriptNotRegistered(format!(
            "expected a 3-element array reply, got {} elements",
            items.len()
        )));
    }

    let code = match &items[0] {
        Value::Int(n) => *n,
        other => {
            return Err(KvError::ScriptNotRegistered(format!(
                "expected an integer outcome code, got {other:?}"
            )))
        }
    };

    let holder = match &items[1] {
        Value::Data(bytes) if bytes.is_empty() => None,
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Nil => None,
        other => {
            return Err(KvError::ScriptNotRegistered(format!(
                "expected a bulk string holder field, got {other:?}"
            )))
        }
    };

    let members = match &items[2] {
        Value::Bulk(members) => members
            .iter()
            .filter_map(|v| match v {
                Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(ScriptReply { code, holder, members })
}
