//! Persistence for tenant-key records.

use std::sync::Arc;

use relay_core::TenantKey;
use relay_storage::{KvStore, StorageKey};

use crate::error::KeyServiceError;

pub struct KeyRepository<S: KvStore> {
    storage: Arc<S>,
}

impl<S: KvStore> KeyRepository<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub async fn find_id_by_hash(
        &self,
        hashed_secret: &str,
    ) -> Result<Option<String>, KeyServiceError> {
        Ok(self.storage.find_tenant_key_id_by_hash(hashed_secret).await?)
    }

    pub async fn get(&self, key_id: &str) -> Result<Option<TenantKey>, KeyServiceError> {
        let Some(raw) = self.storage.get(&StorageKey::apikey(key_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KeyServiceError::Decode {
                key_id: key_id.to_owned(),
                reason: e.to_string(),
            })
    }

    pub async fn put(&self, key: &TenantKey) -> Result<(), KeyServiceError> {
        let raw = serde_json::to_string(key).map_err(|e| KeyServiceError::Decode {
            key_id: key.id.clone(),
            reason: e.to_string(),
        })?;
        self.storage.set(&StorageKey::apikey(&key.id), &raw, None).await?;
        self.storage
            .set(&StorageKey::apikey_hash_index(&key.hashed_secret), &key.id, None)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &TenantKey) -> Result<(), KeyServiceError> {
        self.storage.del(&StorageKey::apikey(&key.id)).await?;
        self.storage
            .del(&StorageKey::apikey_hash_index(&key.hashed_secret))
            .await?;
        Ok(())
    }
}
