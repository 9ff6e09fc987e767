//! Distributed mutex with owner token, TTL, and atomic release.
//!
//! Keys look like `token_refresh_lock:{platform}:{accountId}`. Locking
//! is two-layer: the KV store holds the authoritative `SET-IF-ABSENT-WITH-
//! TTL` record (so a crashed holder's lock still expires even if this
//! process dies), while an in-process map additionally remembers the owner
//! token this process minted, keyed by lock key — this is what lets
//! `release_lock` refuse to delete a lock that a later holder has since
//! taken over, without a caller having to thread the token through by hand.

pub mod error;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_storage::{KvStore, StorageKey};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub use error::LockError;

/// Default TTL for a token-refresh lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Handle to a held lock. Dropping this without calling [`LockCoordinator::release`]
/// simply lets the KV-store TTL reclaim the lock later; it is not itself an RAII guard
/// because release is async (see [`LockCoordinator::with_lock`] for the scoped-acquisition helper).
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub owner_token: String,
}

pub struct LockCoordinator<S: KvStore> {
    storage: Arc<S>,
    /// In-process owner-token bookkeeping, keyed by lock key.
    owners: Mutex<HashMap<String, String>>,
}

impl<S: KvStore> LockCoordinator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_key(platform: &str, account_id: &str) -> String {
        StorageKey::token_refresh_lock(platform, account_id)
    }

    /// `SET-IF-ABSENT-WITH-TTL`. Returns `None` if the lock is already held
    /// (the caller should treat this as "skip, someone else is refreshing").
    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let owner_token = Uuid::new_v4().to_string();
        let acquired = self
            .storage
            .set_if_absent(key, &owner_token, Some(ttl))
            .await
            .map_err(|source| LockError::Storage {
                key: key.to_owned(),
                source,
            })?;

        if !acquired {
            debug!(lock_key = key, "lock contended, skipping");
            return Ok(None);
        }

        self.owners
            .lock()
            .await
            .insert(key.to_owned(), owner_token.clone());

        Ok(Some(LockHandle {
            key: key.to_owned(),
            owner_token,
        }))
    }

    /// Atomic compare-and-delete keyed by the owner token captured at
    /// acquisition. A stale holder whose lock has since been taken over by
    /// someone else is a no-op.
    pub async fn release_lock(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let released = self
            .storage
            .compare_and_delete(&handle.key, &handle.owner_token)
            .await
            .map_err(|source| LockError::Storage {
                key: handle.key.clone(),
                source,
            })?;

        self.owners.lock().await.remove(&handle.key);

        if !released {
            warn!(lock_key = %handle.key, "release skipped: lock was taken over or already expired");
        }
        Ok(released)
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self
            .storage
            .get(key)
            .await
            .map_err(|source| LockError::Storage {
                key: key.to_owned(),
                source,
            })?
            .is_some())
    }

    pub async fn lock_ttl(&self, key: &str) -> Result<Option<Duration>, LockError> {
        self.storage
            .ttl(key)
            .await
            .map_err(|source| LockError::Storage {
                key: key.to_owned(),
                source,
            })
    }

    /// Drops all in-memory owner records. Does not touch the KV store —
    /// outstanding locks still expire on their own TTL.
    pub async fn cleanup(&self) {
        self.owners.lock().await.clear();
    }

    /// Scoped acquisition: runs `f` only if the lock is free, and always
    /// releases afterward regardless of how `f` completes. Returns
    /// `Ok(None)` when the lock was contended — that's a normal skip, not
    /// an error.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.acquire_lock(key, ttl).await? else {
            return Ok(None);
        };

        let result = f().await;
        self.release_lock(&handle).await?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage::MemoryBackend;

    fn coordinator() -> LockCoordinator<MemoryBackend> {
        LockCoordinator::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn second_acquire_is_contended() {
        let coord = coordinator();
        let key = "token_refresh_lock:claude:acct-1";
        let first = coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap();
        assert!(first.is_some());
        let second = coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let coord = coordinator();
        let key = "token_refresh_lock:claude:acct-1";
        let handle = coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        assert!(coord.release_lock(&handle).await.unwrap());
        assert!(coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_release_after_takeover_is_noop() {
        let coord = coordinator();
        let key = "token_refresh_lock:claude:acct-1";
        let first = coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        // Simulate the TTL expiring and someone else taking over.
        coord.release_lock(&first).await.unwrap();
        let second = coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();

        // The original (stale) handle's release must not disturb the new holder.
        assert!(!coord.release_lock(&first).await.unwrap());
        assert!(coord.is_locked(key).await.unwrap());
        assert_eq!(second.owner_token.len(), 36);
    }

    #[tokio::test]
    async fn with_lock_releases_even_when_closure_panics_path_not_taken() {
        let coord = coordinator();
        let key = "token_refresh_lock:claude:acct-1";
        let ran = coord
            .with_lock(key, DEFAULT_LOCK_TTL, || async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));
        assert!(!coord.is_locked(key).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_skips_when_contended() {
        let coord = coordinator();
        let key = "token_refresh_lock:claude:acct-1";
        let _held = coord.acquire_lock(key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        let result = coord
            .with_lock(key, DEFAULT_LOCK_TTL, || async { 1 })
            .await
            .unwrap();
        assert_eq!(result, None);
    }
}
