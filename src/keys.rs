//! KV key layout (§6 "Persisted state layout").

/// `<prefix>write:<key>` — the write-slot string.
pub fn write_key(prefix: &str, key: &str) -> String {
    format!("{prefix}write:{key}")
}

/// `<prefix>read:<key>` — the read-set.
pub fn read_key(prefix: &str, key: &str) -> String {
    format!("{prefix}read:{key}")
}

/// `<prefix>dflag:<key>` — the distributed-flag, written identically on every shard.
pub fn dflag_key(prefix: &str, key: &str) -> String {
    format!("{prefix}dflag:{key}")
}
