//! Tenant-key validation, quota/rate gating, and usage accounting.

pub mod error;
pub mod repository;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use relay_core::pricing::{is_long_context, TokenCounts};
use relay_core::{AccountType, PricingTable, TenantKey};
use relay_cache::LruTtlCache;
use relay_storage::{KvStore, StorageKey};
use tracing::warn;

pub use error::{KeyError, KeyServiceError};
pub use repository::KeyRepository;

/// Validation cache capacity.
const VALIDATION_CACHE_CAPACITY: usize = 100;
/// Validation cache TTL.
const VALIDATION_CACHE_TTL: chrono::Duration = chrono::Duration::minutes(5);
/// Minimum plaintext-secret length accepted by the format check.
const MIN_SECRET_LENGTH: usize = 20;

/// Fully resolved key data returned by `validate_key`.
#[derive(Debug, Clone)]
pub struct ValidatedKeyData {
    pub key: TenantKey,
    pub total_tokens_used: i64,
    pub daily_cost: f64,
    pub weekly_opus_cost: f64,
}

pub struct KeyServiceConfig {
    pub key_prefix: String,
    pub key_salt: String,
}

pub struct KeyService<S: KvStore> {
    repo: KeyRepository<S>,
    config: KeyServiceConfig,
    validation_cache: LruTtlCache<String, ValidatedKeyData>,
    /// Counts calls that actually reached the store, so the claim that a
    /// cache hit never touches the KV store is directly observable in
    /// tests rather than inferred.
    storage_reads: AtomicU64,
}

impl<S: KvStore> KeyService<S> {
    pub fn new(storage: Arc<S>, config: KeyServiceConfig) -> Self {
        Self {
            repo: KeyRepository::new(storage),
            config,
            validation_cache: LruTtlCache::new(VALIDATION_CACHE_CAPACITY),
            storage_reads: AtomicU64::new(0),
        }
    }

    pub fn repository(&self) -> &KeyRepository<S> {
        &self.repo
    }

    pub fn storage_reads(&self) -> u64 {
        self.storage_reads.load(Ordering::SeqCst)
    }

    fn hash_secret(&self, secret: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(self.config.key_salt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// `validateKey`.
    pub async fn validate_key(&self, secret: &str) -> Result<ValidatedKeyData, KeyServiceError> {
        if !secret.starts_with(&self.config.key_prefix) || secret.len() < MIN_SECRET_LENGTH {
            return Err(KeyError::InvalidFormat.into());
        }

        let hashed_secret = self.hash_secret(secret);

        if let Some(cached) = self.validation_cache.get(&hashed_secret).await {
            return Ok(cached);
        }

        self.storage_reads.fetch_add(1, Ordering::SeqCst);
        let Some(key_id) = self.repo.find_id_by_hash(&hashed_secret).await? else {
            return Err(KeyError::NotFound.into());
        };

        let key = self
            .repo
            .get(&key_id)
            .await?
            .ok_or(KeyError::NotFound)?;

        if !key.active {
            return Err(KeyError::Disabled.into());
        }
        let now = Utc::now();
        if key.expires_at.is_some_and(|exp| now > exp) {
            return Err(KeyError::Expired.into());
        }

        let total_tokens_used = self
            .repo
            .storage()
            .get(&StorageKey::usage_total_tokens(&key.id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let today = now.format("%Y-%m-%d").to_string();
        let daily_cost = self
            .repo
            .storage()
            .get(&StorageKey::daily_cost(&key.id, &today))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let week = now.format("%G-W%V").to_string();
        let weekly_opus_cost = self
            .repo
            .storage()
            .get(&StorageKey::weekly_opus_cost(&key.id, &week))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let data = ValidatedKeyData {
            key,
            total_tokens_used,
            daily_cost,
            weekly_opus_cost,
        };

        self.validation_cache
            .set(hashed_secret, data.clone(), VALIDATION_CACHE_TTL)
            .await;

        Ok(data)
    }

    /// Rate/quota enforcement invoked by the relay on accepted requests.
    /// Admits or rejects a single request; the caller is responsible for
    /// calling `decr_concurrency` once the request completes.
    pub async fn admit_request(&self, key: &TenantKey) -> Result<(), KeyServiceError> {
        if key.concurrency_limit > 0 {
            let storage = self.repo.storage();
            let concurrency = storage
                .incr_by(&StorageKey::concurrency(&key.id), 1)
                .await?;
            if concurrency as u32 > key.concurrency_limit {
                storage.incr_by(&StorageKey::concurrency(&key.id), -1).await?;
                return Err(KeyError::ConcurrencyLimit.into());
            }
        }

        if key.rate_limiting_enabled() {
            let window_secs = i64::from(key.rate_limit_window_minutes) * 60;
            let counters = self
                .repo
                .storage()
                .incr_rate_limit_window(&key.id, window_secs, Utc::now().timestamp(), 1, 0, 0.0)
                .await?;
            if counters.requests > key.rate_limit_requests
                || (key.rate_limit_cost > 0.0 && counters.cost > key.rate_limit_cost)
            {
                return Err(KeyError::RateLimitExceeded.into());
            }
        }

        Ok(())
    }

    pub async fn decr_concurrency(&self, key_id: &str) -> Result<(), KeyServiceError> {
        self.repo
            .storage()
            .incr_by(&StorageKey::concurrency(key_id), -1)
            .await?;
        Ok(())
    }

    /// `recordUsage`.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_usage(
        &self,
        key: &TenantKey,
        pricing: &dyn PricingTable,
        model: &str,
        counts: TokenCounts,
        account_id: Option<&str>,
        account_type: Option<AccountType>,
    ) -> Result<relay_core::UsageEvent, KeyServiceError> {
        let known_model = pricing.get(model);
        let cost = known_model.unwrap_or_default().cost(counts);
        let total_input =
            counts.input_tokens + counts.cache_create_tokens + counts.cache_read_tokens;
        let is_long_ctx = is_long_context(model, total_input);

        let storage = self.repo.storage();
        let now = Utc::now();
        let today = now.format("%Y-%m-%d").to_string();

        storage
            .increment_token_usage(&key.id, counts.input_tokens + counts.output_tokens)
            .await?;
        storage
            .incr_by(&StorageKey::usage_model(&key.id, model), 1)
            .await?;
        storage.increment_daily_cost(&key.id, &today, cost).await?;

        if key.rate_limiting_enabled() {
            let window_secs = i64::from(key.rate_limit_window_minutes) * 60;
            let tokens = counts.input_tokens + counts.output_tokens;
            storage
                .incr_rate_limit_window(&key.id, window_secs, now.timestamp(), 0, tokens, cost)
                .await?;
        }

        let mut updated = key.clone();
        updated.last_used_at = Some(now);
        self.repo.put(&updated).await?;

        if let Some(account_id) = account_id {
            let tokens = counts.input_tokens + counts.output_tokens;
            storage
                .incr_by(&StorageKey::usage_total_tokens(account_id), tokens as i64)
                .await?;
        }

        if let Some(account_type) = account_type {
            if account_type.tracks_opus_cost() && model.to_ascii_lowercase().contains("opus") {
                let week = now.format("%G-W%V").to_string();
                storage.incr_by_float(&StorageKey::weekly_opus_cost(&key.id, &week), cost).await?;
            }
        }

        if known_model.is_none() {
            warn!(model, "no pricing entry for model; cost recorded as zero");
        }

        Ok(relay_core::UsageEvent {
            key_id: key.id.clone(),
            account_id: account_id.map(str::to_owned),
            model: model.to_owned(),
            input_tokens: counts.input_tokens,
            output_tokens: counts.output_tokens,
            cache_create_tokens: counts.cache_create_tokens,
            cache_read_tokens: counts.cache_read_tokens,
            ephemeral_5m_tokens: counts.ephemeral_5m_tokens,
            ephemeral_1h_tokens: counts.ephemeral_1h_tokens,
            is_long_context: is_long_ctx,
            cost,
        })
    }

    /// Any key mutation clears the whole validation cache.
    pub async fn update_key(&self, key: &TenantKey) -> Result<(), KeyServiceError> {
        self.repo.put(key).await?;
        self.validation_cache.clear().await;
        Ok(())
    }

    pub async fn delete_key(&self, key: &TenantKey) -> Result<(), KeyServiceError> {
        self.repo.delete(key).await?;
        self.validation_cache.clear().await;
        Ok(())
    }
}
