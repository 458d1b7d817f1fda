//! Acquisition token generation (§4.2).
//!
//! A token is `PP` (two-digit priority, zero-padded, lower wins) followed by a 17-character
//! per-process base and a decimal monotonic counter. Debug mode appends a sentinel and a JSON
//! metadata blob after the core token; comparisons only ever look at the core token.

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

const BASE_LEN: usize = 17;
const BASE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const DEBUG_SENTINEL: &str = " !!DEBUG!! ";

/// Generates a uniformly random 17-character base with at least 64 bits of entropy.
///
/// `BASE_ALPHABET` has 62 symbols, so 17 symbols carry `17 * log2(62) ≈ 101` bits — comfortably
/// above the 64-bit entropy floor this is meant to guarantee.
fn random_base() -> String {
    let mut rng = rand::thread_rng();
    (0..BASE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BASE_ALPHABET.len());
            BASE_ALPHABET[idx] as char
        })
        .collect()
}

/// Diagnostic metadata embedded in a token when `debugTokens` is enabled.
#[derive(Debug, Clone, Serialize)]
pub struct DebugMetadata {
    /// Process-unique id, useful for correlating tokens across log lines from the same locker.
    pub locker_id: uuid::Uuid,
    /// Host-local PID, best-effort.
    pub pid: u32,
}

/// Produces unique, comparable acquisition tokens for one locker instance.
///
/// `tokenBase` is fixed for the lifetime of the generator (or overridden per `LockOptions`, as
/// lock sets do, so every writer from the same set shares conflict-resolution identity). The
/// counter is monotone and incremented atomically.
pub struct TokenGenerator {
    base: String,
    counter: AtomicU64,
    debug: Option<DebugMetadata>,
}

impl TokenGenerator {
    /// Create a generator with a fresh random base.
    pub fn new(debug_tokens: bool) -> Self {
        Self::with_base(random_base(), debug_tokens)
    }

    /// Create a generator with an explicit base (used by `LockSet` and by `options.tokenBase`
    /// overrides so all writers from one logical caller compare consistently).
    pub fn with_base(base: String, debug_tokens: bool) -> Self {
        let debug = debug_tokens.then(|| DebugMetadata {
            locker_id: uuid::Uuid::new_v4(),
            pid: std::process::id(),
        });
        Self {
            base,
            counter: AtomicU64::new(0),
            debug,
        }
    }

    /// The base this generator stamps into every token it produces.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Produce the next token for the given conflict priority (0-99, lower wins).
    pub fn next(&self, priority: u8) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let core = format!("{:02}{}{}", priority.min(99), self.base, n);

        match &self.debug {
            Some(meta) => {
                let json = serde_json::to_string(meta).unwrap_or_default();
                format!("{core}{DEBUG_SENTINEL}{json}")
            }
            None => core,
        }
    }
}

/// Strips any debug sentinel/metadata suffix, returning the core token used for comparisons.
pub fn core_token(token: &str) -> &str {
    match token.find(DEBUG_SENTINEL) {
        Some(idx) => &token[..idx],
        None => token,
    }
}

/// Conflict-resolution comparison: byte-lexicographic order over the core token, so the
/// priority prefix dominates and, within equal priority, the base/counter break ties.
pub fn wins_conflict(ours: &str, theirs: &str) -> bool {
    core_token(ours) < core_token(theirs)
}
