//! Token refresh coordinator.
//!
//! Wraps [`relay_lock::LockCoordinator`] around a [`PlatformRefresher`]:
//! at most one refresh per `(accountId, platform)` runs at any instant,
//! contenders skip rather than block, and the lock is always released
//! on every exit path via `with_lock`'s scoped acquisition.

pub mod error;
pub mod mask;
pub mod refresher;

use std::sync::Arc;
use std::time::Duration;

use relay_core::{CredentialBundle, UpstreamAccount};
use relay_lock::LockCoordinator;
use relay_scheduler::Scheduler;
use relay_storage::KvStore;
use tracing::{error, info};

pub use error::RefreshError;
pub use refresher::PlatformRefresher;

/// Minimum remaining lifetime before a token is considered still valid.
pub const DEFAULT_REFRESH_GRACE: chrono::Duration = chrono::Duration::seconds(300);

pub struct TokenRefreshService<S: KvStore> {
    lock: Arc<LockCoordinator<S>>,
    scheduler: Arc<Scheduler<S>>,
    refresher: Arc<dyn PlatformRefresher>,
    grace: chrono::Duration,
}

impl<S: KvStore> TokenRefreshService<S> {
    pub fn new(
        lock: Arc<LockCoordinator<S>>,
        scheduler: Arc<Scheduler<S>>,
        refresher: Arc<dyn PlatformRefresher>,
    ) -> Self {
        Self {
            lock,
            scheduler,
            refresher,
            grace: DEFAULT_REFRESH_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: chrono::Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Ensures the account's access token is fresh, refreshing it first if
    /// it's within the expiry grace window. Returns the account's currently
    /// valid (or just-refreshed)
    /// access token. If another worker is already refreshing, this call
    /// skips and returns the account's present credential bundle as-is
    /// (telemetry: `skipped`); the caller may observe a token that is
    /// refreshed moments later by the lock holder.
    pub async fn ensure_fresh_token(
        &self,
        account_id: &str,
        platform: &str,
    ) -> Result<CredentialBundle, RefreshError> {
        let lock_key = LockCoordinator::<S>::lock_key(platform, account_id);

        let outcome = self
            .lock
            .with_lock(&lock_key, relay_lock::DEFAULT_LOCK_TTL, || {
                self.do_refresh(account_id, platform)
            })
            .await?;

        match outcome {
            Some(result) => result,
            None => {
                info!(account_id, platform, "refresh skipped: lock contended");
                let account = self
                    .scheduler
                    .repository()
                    .get(account_id)
                    .await?
                    .ok_or_else(|| RefreshError::AccountNotFound {
                        account_id: account_id.to_owned(),
                    })?;
                Ok(account.credentials)
            }
        }
    }

    async fn do_refresh(
        &self,
        account_id: &str,
        platform: &str,
    ) -> Result<CredentialBundle, RefreshError> {
        info!(account_id, platform, "refresh start");

        let mut account =
            self.scheduler
                .repository()
                .get(account_id)
                .await?
                .ok_or_else(|| RefreshError::AccountNotFound {
                    account_id: account_id.to_owned(),
                })?;

        if account.credentials.is_valid(chrono::Utc::now(), self.grace) {
            info!(account_id, platform, "refresh skipped: token still valid");
            return Ok(account.credentials);
        }

        self.scheduler.mark_refreshing(account_id).await?;

        match self.refresher.refresh(&account).await {
            Ok(new_credentials) => {
                account.credentials = new_credentials.clone();
                account.status = relay_core::AccountStatus::Ready;
                self.scheduler.repository().put(&account).await?;
                info!(
                    account_id,
                    platform,
                    access_token = %mask::mask_token(&new_credentials.access_token),
                    "refresh success"
                );
                Ok(new_credentials)
            }
            Err(reason) => {
                error!(account_id, platform, attempt = 1, %reason, "refresh error");
                // Do not retry inside the lock; leave status as
                // whatever it was before (scheduler will re-evaluate on next
                // selection / relay classification).
                self.scheduler.mark_ready(account_id).await.ok();
                Err(RefreshError::Exchange {
                    platform: platform.to_owned(),
                    account_id: account_id.to_owned(),
                    attempt: 1,
                    reason,
                })
            }
        }
    }
}

/// Convenience used by [`TokenRefreshService`]'s tests and by callers that
/// want to check validity without going through the full refresh flow.
pub fn needs_refresh(account: &UpstreamAccount, grace: Duration) -> bool {
    !account
        .credentials
        .is_valid(chrono::Utc::now(), chrono::Duration::from_std(grace).unwrap_or_default())
}
