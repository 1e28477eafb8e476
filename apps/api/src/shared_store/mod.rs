//! Process-external home for the few pieces of mutable state that are shared
//! between requests: rate-limit windows, metrics counters, installation state
//! tokens and webhook idempotency keys.
//!
//! `MemorySharedStore` is only correct for a single instance. Anything
//! horizontally scaled must run on `RedisSharedStore`.

pub mod memory;
pub mod redis_store;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use self::memory::MemorySharedStore;
pub use self::redis_store::RedisSharedStore;

/// State of a sliding window after one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Admitted hits in the trailing window plus this one. Above the limit
    /// means this hit was refused.
    pub count: u32,
    /// Time until the oldest admitted hit leaves the window and frees a slot.
    pub resets_in: Duration,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Counts one hit against `key` over the trailing `window`. The hit is
    /// only recorded while the count stays within `limit`. Hits older than
    /// the window are dropped when the key is next touched.
    async fn hit_window(&self, key: &str, window: Duration, limit: u32) -> Result<WindowHit>;

    /// Adds `by` to a named counter and returns the new total.
    async fn incr_counter(&self, name: &str, by: u64) -> Result<u64>;

    /// Snapshot of every counter.
    async fn counters(&self) -> Result<BTreeMap<String, u64>>;

    /// Stores a single-use token that expires after `ttl`.
    async fn put_token(&self, token: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Removes and returns a token's value. A second call returns `None`.
    async fn take_token(&self, token: &str) -> Result<Option<String>>;

    /// Returns true the first time `key` is seen within `ttl`, false afterwards.
    async fn claim_once(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Drops a claim so the next `claim_once` for `key` succeeds again.
    async fn release_claim(&self, key: &str) -> Result<()>;
}
