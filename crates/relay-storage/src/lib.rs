//! Typed key-value store adapter.
//!
//! This crate wraps an external key-value store (Redis-shaped: get/set with
//! TTL, atomic increment, expire, pattern listing, and a compare-and-delete
//! primitive evaluated atomically server-side) behind a single
//! [`KvStore`] trait. Every higher-level component depends on this trait, never on a
//! concrete backend, so tests run against [`MemoryBackend`] and production
//! wires in [`RedisBackend`] (behind the `redis` feature).
//!
//! Three domain helpers (finding a tenant key by its hashed secret,
//! incrementing token usage, incrementing daily cost) are default-provided
//! methods built from the primitive ops, keyed per the layout in
//! [`crate::keys`].

pub mod error;
mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use error::StorageError;
pub use keys::StorageKey;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;

/// Result of an atomic rate-limit window increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowCounters {
    pub window_start_epoch_secs: i64,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Async key-value store contract.
///
/// All operations are safe under concurrent callers; `compare_and_delete`
/// and `incr_rate_limit_window` are the atomic-script-eval primitives lock
/// release and window resets are built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// `SET key value` only if `key` is currently absent. Used by the lock
    /// coordinator's `acquireLock`.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError>;

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StorageError>;

    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64, StorageError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    async fn del(&self, key: &str) -> Result<bool, StorageError>;

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError>;

    /// Atomic compare-and-delete: deletes `key` only if its current value
    /// equals `expected`. This is the atomic-script-eval basis for the lock
    /// coordinator's `releaseLock` — a stale owner's release becomes
    /// a no-op rather than deleting a lock someone else now holds.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// Atomic rate-limit window increment-or-reset. If `now_epoch_secs` has
    /// moved past `window_start + window_secs`, the window is reset to
    /// start at `now_epoch_secs` with counters equal to this increment;
    /// otherwise the increment is added to the existing window.
    async fn incr_rate_limit_window(
        &self,
        key_id: &str,
        window_secs: i64,
        now_epoch_secs: i64,
        requests_inc: u64,
        tokens_inc: u64,
        cost_inc: f64,
    ) -> Result<WindowCounters, StorageError>;

    /// `findTenantKeyByHashedSecret`: resolve a hashed
    /// secret to a tenant-key id via the `apikey:hash:{hashedSecret}` index.
    async fn find_tenant_key_id_by_hash(
        &self,
        hashed_secret: &str,
    ) -> Result<Option<String>, StorageError> {
        self.get(&StorageKey::apikey_hash_index(hashed_secret)).await
    }

    /// `incrementTokenUsage`: bump the key's running token
    /// total and return the new value.
    async fn increment_token_usage(&self, key_id: &str, tokens: u64) -> Result<i64, StorageError> {
        self.incr_by(&StorageKey::usage_total_tokens(key_id), tokens as i64)
            .await
    }

    /// `incrementDailyCost`: bump the key's cost counter for
    /// `date` (`YYYY-MM-DD`) and return the new running total.
    async fn increment_daily_cost(
        &self,
        key_id: &str,
        date: &str,
        cost: f64,
    ) -> Result<f64, StorageError> {
        self.incr_by_float(&StorageKey::daily_cost(key_id, date), cost).await
    }
}
