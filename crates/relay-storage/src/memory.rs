//! In-memory [`KvStore`] backend for tests and local development.
//!
//! All state lives behind a single `tokio::sync::Mutex` guarding a
//! `HashMap`. This is not meant to scale the way a real Redis deployment
//! would; it exists to exercise every atomic contract the trait promises
//! (compare-and-delete, window reset-or-increment) without a network
//! dependency, mirroring this codebase's `MemoryBackend` testing pattern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{KvStore, StorageError, WindowCounters};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: chrono::DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// In-memory backend, safe to share across tasks via `Clone`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Option<Duration>) -> Option<chrono::DateTime<Utc>> {
        ttl.map(|d| {
            Utc::now()
                + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::seconds(0))
        })
    }
}

#[async_trait]
impl KvStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        if let Some(entry) = data.get(key) {
            if entry.is_expired(now) {
                data.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut data = self.data.lock().await;
        data.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        if let Some(existing) = data.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        data.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StorageError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let current: i64 = match data.get(key) {
            Some(e) if !e.is_expired(now) => e.value.parse().unwrap_or(0),
            _ => 0,
        };
        let updated = current + amount;
        let expires_at = data.get(key).and_then(|e| e.expires_at);
        data.insert(
            key.to_owned(),
            Entry {
                value: updated.to_string(),
                expires_at,
            },
        );
        Ok(updated)
    }

    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64, StorageError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let current: f64 = match data.get(key) {
            Some(e) if !e.is_expired(now) => e.value.parse().unwrap_or(0.0),
            _ => 0.0,
        };
        let updated = current + amount;
        let expires_at = data.get(key).and_then(|e| e.expires_at);
        data.insert(
            key.to_owned(),
            Entry {
                value: updated.to_string(),
                expires_at,
            },
        );
        Ok(updated)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut data = self.data.lock().await;
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Self::expiry(Some(ttl));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        let mut data = self.data.lock().await;
        Ok(data.remove(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let data = self.data.lock().await;
        let now = Utc::now();
        Ok(data.get(key).and_then(|e| e.expires_at).and_then(|exp| {
            (exp - now).to_std().ok()
        }))
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        data.retain(|_, e| !e.is_expired(now));
        let prefix = pattern.trim_end_matches('*');
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.get(&format!("{key}::{field}")).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.set(&format!("{key}::{field}"), value, None).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        match data.get(key) {
            Some(entry) if !entry.is_expired(now) && entry.value == expected => {
                data.remove(key);
                Ok(true)
            }
            Some(entry) if entry.is_expired(now) => {
                data.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn incr_rate_limit_window(
        &self,
        key_id: &str,
        window_secs: i64,
        now_epoch_secs: i64,
        requests_inc: u64,
        tokens_inc: u64,
        cost_inc: f64,
    ) -> Result<WindowCounters, StorageError> {
        use crate::StorageKey;

        let mut data = self.data.lock().await;
        let start_key = StorageKey::rate_limit_window_start(key_id);
        let req_key = StorageKey::rate_limit_requests(key_id);
        let tok_key = StorageKey::rate_limit_tokens(key_id);
        let cost_key = StorageKey::rate_limit_cost(key_id);

        let window_start: i64 = data
            .get(&start_key)
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(now_epoch_secs);

        let is_stale = data.get(&start_key).is_none() || now_epoch_secs >= window_start + window_secs;

        let (new_start, new_requests, new_tokens, new_cost) = if is_stale {
            (now_epoch_secs, requests_inc, tokens_inc, cost_inc)
        } else {
            let requests: u64 = data.get(&req_key).and_then(|e| e.value.parse().ok()).unwrap_or(0);
            let tokens: u64 = data.get(&tok_key).and_then(|e| e.value.parse().ok()).unwrap_or(0);
            let cost: f64 = data.get(&cost_key).and_then(|e| e.value.parse().ok()).unwrap_or(0.0);
            (
                window_start,
                requests + requests_inc,
                tokens + tokens_inc,
                cost + cost_inc,
            )
        };

        let plain = |v: String| Entry {
            value: v,
            expires_at: None,
        };
        data.insert(start_key, plain(new_start.to_string()));
        data.insert(req_key, plain(new_requests.to_string()));
        data.insert(tok_key, plain(new_tokens.to_string()));
        data.insert(cost_key, plain(new_cost.to_string()));

        Ok(WindowCounters {
            window_start_epoch_secs: new_start,
            requests: new_requests,
            tokens: new_tokens,
            cost: new_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_roundtrip() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_owned()));
    }

    #[tokio::test]
    async fn ttl_expiry_removes_on_get() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_respects_existing_value() {
        let backend = MemoryBackend::new();
        assert!(backend.set_if_absent("k", "v1", None).await.unwrap());
        assert!(!backend.set_if_absent("k", "v2", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some("v1".to_owned()));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let backend = MemoryBackend::new();
        backend.set("lock", "owner-a", None).await.unwrap();
        assert!(!backend.compare_and_delete("lock", "owner-b").await.unwrap());
        assert!(backend.get("lock").await.unwrap().is_some());
        assert!(backend.compare_and_delete("lock", "owner-a").await.unwrap());
        assert!(backend.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incr_by_accumulates() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.incr_by("c", 3).await.unwrap(), 3);
        assert_eq!(backend.incr_by("c", 4).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn rate_limit_window_resets_after_elapsed() {
        let backend = MemoryBackend::new();
        let first = backend
            .incr_rate_limit_window("key1", 60, 1_000, 1, 10, 0.1)
            .await
            .unwrap();
        assert_eq!(first.requests, 1);

        let within_window = backend
            .incr_rate_limit_window("key1", 60, 1_030, 1, 10, 0.1)
            .await
            .unwrap();
        assert_eq!(within_window.requests, 2);
        assert_eq!(within_window.window_start_epoch_secs, 1_000);

        let after_window = backend
            .incr_rate_limit_window("key1", 60, 1_100, 1, 10, 0.1)
            .await
            .unwrap();
        assert_eq!(after_window.requests, 1);
        assert_eq!(after_window.window_start_epoch_secs, 1_100);
    }

    #[tokio::test]
    async fn keys_by_pattern_matches_prefix() {
        let backend = MemoryBackend::new();
        backend.set("apikey:1", "a", None).await.unwrap();
        backend.set("apikey:2", "b", None).await.unwrap();
        backend.set("session:x", "c", None).await.unwrap();
        let keys = backend.keys_by_pattern("apikey:*").await.unwrap();
        assert_eq!(keys, vec!["apikey:1".to_owned(), "apikey:2".to_owned()]);
    }
}
