//! # rzlock - Distributed Reader/Writer Locks
//!
//! Distributed reader/writer locks layered over a sharded, Redis-class in-memory key/value
//! store. Clients acquire read or write leases on opaque string keys; leases coordinate mutual
//! exclusion across independent processes talking to the same shards.
//!
//! ## Architecture
//!
//! - [`scripts`]: the eight atomic server-side lock routines and their reply decoding
//! - [`token`]: acquisition token generation (priority + per-process base + monotonic counter)
//! - [`engine`]: the retry/backoff/conflict-resolution acquisition loop
//! - [`handle`]: an owned lease, its heartbeat task, and upgrade
//! - [`distributed`]: random-shard reads, all-shard write fan-out, and auto mode
//! - [`lock_set`]: ref-counted handle aggregation with dependent sets
//! - [`locker`]: the top-level facade tying the above together
//! - [`kv`]: the KV client contract, a Redis-backed implementation, and an in-memory test double
//!
//! This crate does not implement durable locks, leader election, fencing tokens handed to a
//! backend, waiter fairness, or lock modes beyond shared-read/exclusive-write.

#![warn(clippy::all)]

pub mod distributed;
pub mod engine;
pub mod error;
pub mod handle;
pub mod keys;
pub mod kv;
pub mod lock_set;
pub mod locker;
pub mod options;
pub mod scripts;
pub mod token;

pub use distributed::DistributedWriteHandle;
pub use error::{KvError, LockError, LockResult, Role};
pub use handle::Handle;
pub use kv::{InMemoryKvClient, KvClient, RedisKvClient, ShardClient, ShardSelector};
pub use lock_set::LockSet;
pub use locker::{Locker, WriteHandle};
pub use options::{Distributed, LockOptions, LockerConfig, OnError};

/// Re-export version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
