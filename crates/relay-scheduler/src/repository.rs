//! Persistence for upstream accounts and session affinity mappings.
//!
//! The scheduler exclusively owns account status and session mappings; this module is the only place either is read or written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::{AccountStatus, Provider, SessionMapping, UpstreamAccount};
use relay_storage::{KvStore, StorageKey};

use crate::error::SchedulerError;

pub struct AccountRepository<S: KvStore> {
    storage: Arc<S>,
}

impl<S: KvStore> AccountRepository<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<UpstreamAccount>, SchedulerError> {
        let Some(raw) = self.storage.get(&StorageKey::claude_account(account_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SchedulerError::Decode {
                account_id: account_id.to_owned(),
                reason: e.to_string(),
            })
    }

    pub async fn require(&self, account_id: &str) -> Result<UpstreamAccount, SchedulerError> {
        self.get(account_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound {
                account_id: account_id.to_owned(),
            })
    }

    pub async fn put(&self, account: &UpstreamAccount) -> Result<(), SchedulerError> {
        let raw = serde_json::to_string(account).map_err(|e| SchedulerError::Decode {
            account_id: account.id.clone(),
            reason: e.to_string(),
        })?;
        self.storage
            .set(&StorageKey::claude_account(&account.id), &raw, None)
            .await?;
        Ok(())
    }

    /// Enumerates every stored account for `provider`. A real Redis
    /// deployment would maintain a provider-indexed set; the pattern scan
    /// here is adequate for the in-memory backend and small deployments.
    pub async fn candidates_for_provider(
        &self,
        provider: Provider,
    ) -> Result<Vec<UpstreamAccount>, SchedulerError> {
        let keys = self.storage.keys_by_pattern("claude_account:*").await?;
        let mut out = Vec::new();
        for key in keys {
            // Skip derived sub-keys like `claude_account:{id}:401_errors`.
            if key.matches(':').count() != 1 {
                continue;
            }
            let Some(raw) = self.storage.get(&key).await? else {
                continue;
            };
            if let Ok(account) = serde_json::from_str::<UpstreamAccount>(&raw) {
                if account.account_type.provider() == provider {
                    out.push(account);
                }
            }
        }
        Ok(out)
    }

    pub async fn get_session(&self, session_hash: &str) -> Result<Option<String>, SchedulerError> {
        Ok(self.storage.get(&StorageKey::session(session_hash)).await?)
    }

    pub async fn set_session(
        &self,
        session_hash: &str,
        account_id: &str,
        ttl: Duration,
    ) -> Result<(), SchedulerError> {
        self.storage
            .set(&StorageKey::session(session_hash), account_id, Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn clear_session(&self, session_hash: &str) -> Result<(), SchedulerError> {
        self.storage.del(&StorageKey::session(session_hash)).await?;
        Ok(())
    }

    /// Loads a [`SessionMapping`] with a synthetic TTL-derived expiry, for
    /// callers that want the full struct rather than the bare account id.
    pub async fn session_mapping(
        &self,
        session_hash: &str,
        ttl: Duration,
    ) -> Result<Option<SessionMapping>, SchedulerError> {
        let Some(account_id) = self.get_session(session_hash).await? else {
            return Ok(None);
        };
        Ok(Some(SessionMapping {
            session_hash: session_hash.to_owned(),
            account_id,
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }))
    }

    pub async fn incr_401(&self, account_id: &str) -> Result<i64, SchedulerError> {
        let key = StorageKey::account_401_errors(account_id);
        let value = self.storage.incr_by(&key, 1).await?;
        if value == 1 {
            self.storage.expire(&key, Duration::from_secs(300)).await?;
        }
        Ok(value)
    }

    pub async fn clear_401(&self, account_id: &str) -> Result<(), SchedulerError> {
        self.storage.del(&StorageKey::account_401_errors(account_id)).await?;
        Ok(())
    }

    pub async fn incr_5xx(&self, account_id: &str) -> Result<i64, SchedulerError> {
        let key = StorageKey::account_5xx_errors(account_id);
        let value = self.storage.incr_by(&key, 1).await?;
        if value == 1 {
            self.storage.expire(&key, Duration::from_secs(300)).await?;
        }
        Ok(value)
    }

    pub async fn clear_5xx(&self, account_id: &str) -> Result<(), SchedulerError> {
        self.storage.del(&StorageKey::account_5xx_errors(account_id)).await?;
        Ok(())
    }

    /// `AccountStatus::Ready` as produced by `markReady`, preserved here
    /// so the repository (not every caller) is the single source of truth
    /// for "what does ready look like".
    pub fn ready_status() -> AccountStatus {
        AccountStatus::Ready
    }
}
