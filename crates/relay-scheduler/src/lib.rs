//! Upstream account scheduler: selection, sticky sessions, and status
//! transitions. The scheduler exclusively owns account status and
//! session affinity mappings.

pub mod error;
pub mod repository;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::{AccountStatus, Provider, TenantKey, UpstreamAccount};
use relay_storage::KvStore;
use tracing::{debug, warn};

pub use error::SchedulerError;
pub use repository::AccountRepository;

/// Default sticky-session TTL.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(900);
/// Default 401-streak threshold before `markUnauthorized` fires.
pub const DEFAULT_UNAUTHORIZED_THRESHOLD: i64 = 1;
/// Default 5xx-streak threshold before `markTempError` fires.
pub const DEFAULT_TEMP_ERROR_THRESHOLD: i64 = 10;

/// Result of a successful selection.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub account_id: String,
    pub account_type: relay_core::AccountType,
}

pub struct SchedulerConfig {
    pub session_ttl: Duration,
    pub unauthorized_threshold: i64,
    pub temp_error_threshold: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            unauthorized_threshold: DEFAULT_UNAUTHORIZED_THRESHOLD,
            temp_error_threshold: DEFAULT_TEMP_ERROR_THRESHOLD,
        }
    }
}

pub struct Scheduler<S: KvStore> {
    repo: AccountRepository<S>,
    config: SchedulerConfig,
    /// Per-provider round-robin cursor over the lexicographically sorted
    /// candidate list — deterministic under ties.
    round_robin: std::sync::Mutex<std::collections::HashMap<Provider, AtomicUsize>>,
}

impl<S: KvStore> Scheduler<S> {
    pub fn new(storage: Arc<S>, config: SchedulerConfig) -> Self {
        Self {
            repo: AccountRepository::new(storage),
            config,
            round_robin: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn repository(&self) -> &AccountRepository<S> {
        &self.repo
    }

    fn provider_for(key: &TenantKey, model: Option<&str>) -> Provider {
        model
            .and_then(|m| {
                if m.contains("gemini") {
                    Some(Provider::Gemini)
                } else if m.contains("gpt") || m.contains("openai") {
                    Some(Provider::OpenAi)
                } else if m.contains("claude") {
                    Some(Provider::Claude)
                } else {
                    None
                }
            })
            .unwrap_or(match key.permissions {
                relay_core::KeyPermission::Claude => Provider::Claude,
                relay_core::KeyPermission::Gemini => Provider::Gemini,
                relay_core::KeyPermission::Openai => Provider::OpenAi,
                relay_core::KeyPermission::All => Provider::Claude,
            })
    }

    fn is_effectively_ready(account: &UpstreamAccount, now: DateTime<Utc>) -> bool {
        account.active
            && account.schedulable
            && match account.status {
                AccountStatus::Ready => true,
                AccountStatus::RateLimited { reset_at } => now >= reset_at,
                _ => false,
            }
    }

    /// `selectAccountForKey`.
    pub async fn select_account_for_key(
        &self,
        key: &TenantKey,
        session_hash: Option<&str>,
        model: Option<&str>,
    ) -> Result<SelectedAccount, SchedulerError> {
        let provider = Self::provider_for(key, model);
        let now = Utc::now();

        // Step 1: explicit per-provider binding.
        if let Some(bound_id) = key.bound_accounts.get(&provider) {
            if let Some(account) = self.repo.get(bound_id).await? {
                if Self::is_effectively_ready(&account, now) {
                    return Ok(SelectedAccount {
                        account_id: account.id,
                        account_type: account.account_type,
                    });
                }
            }
        }

        // Step 2: sticky session.
        if let Some(hash) = session_hash {
            if let Some(account_id) = self.repo.get_session(hash).await? {
                if let Some(account) = self.repo.get(&account_id).await? {
                    if Self::is_effectively_ready(&account, now) {
                        return Ok(SelectedAccount {
                            account_id: account.id,
                            account_type: account.account_type,
                        });
                    }
                }
            }
        }

        // Step 3: enumerate + filter candidates.
        let mut candidates: Vec<UpstreamAccount> = self
            .repo
            .candidates_for_provider(provider)
            .await?
            .into_iter()
            .filter(|a| Self::is_effectively_ready(a, now))
            .filter(|a| {
                model
                    .map(|m| {
                        // Model-restriction filtering is account-type agnostic here;
                        // a restricted-models list, if present on the key, is
                        // enforced earlier by the relay engine.
                        let _ = m;
                        true
                    })
                    .unwrap_or(true)
            })
            .collect();

        if candidates.is_empty() {
            return Err(SchedulerError::AllAccountsExhausted {
                provider: provider.to_string(),
            });
        }

        // Step 4: deterministic ordering + round-robin selection.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let chosen = {
            let mut guard = self.round_robin.lock().unwrap_or_else(|e| e.into_inner());
            let cursor = guard
                .entry(provider)
                .or_insert_with(|| AtomicUsize::new(0));
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            candidates[idx].clone()
        };

        // Step 5: bind sticky session, if requested.
        if let Some(hash) = session_hash {
            self.repo
                .set_session(hash, &chosen.id, self.config.session_ttl)
                .await?;
        }

        debug!(account_id = %chosen.id, %provider, "account selected");
        Ok(SelectedAccount {
            account_id: chosen.id,
            account_type: chosen.account_type,
        })
    }

    /// `markRateLimited`: idempotent, later `reset_at` always wins, an
    /// earlier-or-equal `reset_at` on an already rate-limited account is a
    /// no-op.
    pub async fn mark_rate_limited(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
        reset_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        let next_reset = match account.status {
            AccountStatus::RateLimited { reset_at: existing } if existing >= reset_at => existing,
            _ => reset_at,
        };
        account.status = AccountStatus::RateLimited { reset_at: next_reset };
        self.repo.put(&account).await?;
        if let Some(hash) = session_hash {
            self.repo.clear_session(hash).await?;
        }
        warn!(account_id, reset_at = %next_reset, "account rate-limited");
        Ok(())
    }

    /// Increments the rolling 401 counter and transitions to `Unauthorized`
    /// once the configured threshold is crossed.
    pub async fn record_unauthorized_response(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
    ) -> Result<bool, SchedulerError> {
        let count = self.repo.incr_401(account_id).await?;
        if count >= self.config.unauthorized_threshold {
            self.mark_unauthorized(account_id, session_hash).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn mark_unauthorized(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        account.status = AccountStatus::Unauthorized;
        self.repo.put(&account).await?;
        if let Some(hash) = session_hash {
            self.repo.clear_session(hash).await?;
        }
        warn!(account_id, "account marked unauthorized");
        Ok(())
    }

    pub async fn mark_blocked(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        account.status = AccountStatus::Blocked;
        self.repo.put(&account).await?;
        if let Some(hash) = session_hash {
            self.repo.clear_session(hash).await?;
        }
        warn!(account_id, "account blocked (terminal, requires operator action)");
        Ok(())
    }

    /// Increments the rolling 5xx counter and transitions to `TempError`
    /// once the configured threshold is crossed.
    pub async fn record_server_error_response(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
    ) -> Result<bool, SchedulerError> {
        let count = self.repo.incr_5xx(account_id).await?;
        if count >= self.config.temp_error_threshold {
            self.mark_temp_error(account_id, session_hash).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn mark_temp_error(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        account.status = AccountStatus::TempError;
        self.repo.put(&account).await?;
        if let Some(hash) = session_hash {
            self.repo.clear_session(hash).await?;
        }
        warn!(account_id, "account marked temp-error");
        Ok(())
    }

    /// `removeRateLimit` / 2xx classification: clears rate-limit status and
    /// both error counters.
    pub async fn record_success_response(&self, account_id: &str) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        if matches!(account.status, AccountStatus::RateLimited { .. }) {
            account.status = AccountStatus::Ready;
            self.repo.put(&account).await?;
        }
        self.repo.clear_401(account_id).await?;
        self.repo.clear_5xx(account_id).await?;
        Ok(())
    }

    /// Periodic sweep: auto-recovers any `TempError` account back to `Ready`.
    pub async fn clear_internal_errors(&self, account_id: &str) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        if account.status == AccountStatus::TempError {
            account.status = AccountStatus::Ready;
            self.repo.put(&account).await?;
        }
        Ok(())
    }

    pub async fn mark_refreshing(&self, account_id: &str) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        account.status = AccountStatus::Refreshing;
        self.repo.put(&account).await
    }

    pub async fn mark_ready(&self, account_id: &str) -> Result<(), SchedulerError> {
        let mut account = self.repo.require(account_id).await?;
        account.status = AccountStatus::Ready;
        self.repo.put(&account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{AccountType, CredentialBundle};
    use relay_storage::MemoryBackend;
    use std::collections::HashMap;

    fn account(id: &str, status: AccountStatus) -> UpstreamAccount {
        UpstreamAccount {
            id: id.to_owned(),
            account_type: AccountType::ClaudeOfficial,
            credentials: CredentialBundle {
                access_token: "tok".into(),
                refresh_token: None,
                expires_at: None,
                scopes: vec![],
            },
            proxy: None,
            active: true,
            status,
            schedulable: true,
            unified_user_agent_opt_in: false,
            captured_headers: HashMap::new(),
            session_window_status: None,
        }
    }

    fn key() -> TenantKey {
        TenantKey {
            id: "k1".into(),
            name: "t".into(),
            hashed_secret: "h".into(),
            active: true,
            expires_at: None,
            permissions: relay_core::KeyPermission::Claude,
            bound_accounts: HashMap::new(),
            token_limit: None,
            concurrency_limit: 0,
            rate_limit_window_minutes: 0,
            rate_limit_requests: 0,
            rate_limit_cost: 0.0,
            daily_cost_limit: None,
            weekly_opus_cost_limit: None,
            restricted_models: None,
            allowed_clients: None,
            tags: vec![],
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    fn scheduler() -> Scheduler<MemoryBackend> {
        Scheduler::new(Arc::new(MemoryBackend::new()), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn selects_ready_candidate() {
        let sched = scheduler();
        sched
            .repository()
            .put(&account("a1", AccountStatus::Ready))
            .await
            .unwrap();
        let selected = sched
            .select_account_for_key(&key(), None, Some("claude-3-sonnet"))
            .await
            .unwrap();
        assert_eq!(selected.account_id, "a1");
    }

    #[tokio::test]
    async fn exhausted_when_no_ready_candidates() {
        let sched = scheduler();
        sched
            .repository()
            .put(&account("a1", AccountStatus::Blocked))
            .await
            .unwrap();
        let err = sched
            .select_account_for_key(&key(), None, Some("claude-3-sonnet"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AllAccountsExhausted { .. }));
    }

    #[tokio::test]
    async fn sticky_session_pins_account_across_calls() {
        let sched = scheduler();
        sched.repository().put(&account("a1", AccountStatus::Ready)).await.unwrap();
        sched.repository().put(&account("a2", AccountStatus::Ready)).await.unwrap();

        let first = sched
            .select_account_for_key(&key(), Some("sess-1"), Some("claude-3-sonnet"))
            .await
            .unwrap();
        let second = sched
            .select_account_for_key(&key(), Some("sess-1"), Some("claude-3-sonnet"))
            .await
            .unwrap();
        assert_eq!(first.account_id, second.account_id);
    }

    #[tokio::test]
    async fn rate_limited_idempotence_later_reset_wins() {
        let sched = scheduler();
        sched.repository().put(&account("a1", AccountStatus::Ready)).await.unwrap();

        let earlier = Utc::now() + chrono::Duration::seconds(10);
        let later = Utc::now() + chrono::Duration::seconds(100);

        sched.mark_rate_limited("a1", None, later).await.unwrap();
        sched.mark_rate_limited("a1", None, earlier).await.unwrap();

        let account = sched.repository().require("a1").await.unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited { reset_at: later });
    }

    #[tokio::test]
    async fn unauthorized_threshold_gates_transition() {
        let sched = Scheduler::new(
            Arc::new(MemoryBackend::new()),
            SchedulerConfig {
                unauthorized_threshold: 2,
                ..SchedulerConfig::default()
            },
        );
        sched.repository().put(&account("a1", AccountStatus::Ready)).await.unwrap();

        let first = sched.record_unauthorized_response("a1", None).await.unwrap();
        assert!(!first);
        let second = sched.record_unauthorized_response("a1", None).await.unwrap();
        assert!(second);

        let account = sched.repository().require("a1").await.unwrap();
        assert_eq!(account.status, AccountStatus::Unauthorized);
    }

    #[tokio::test]
    async fn success_response_clears_counters_and_rate_limit() {
        let sched = scheduler();
        let reset_at = Utc::now() + chrono::Duration::seconds(60);
        sched
            .repository()
            .put(&account("a1", AccountStatus::RateLimited { reset_at }))
            .await
            .unwrap();
        sched.repository().incr_401("a1").await.unwrap();
        sched.repository().incr_5xx("a1").await.unwrap();

        sched.record_success_response("a1").await.unwrap();

        let account = sched.repository().require("a1").await.unwrap();
        assert_eq!(account.status, AccountStatus::Ready);
        assert_eq!(sched.repository().incr_401("a1").await.unwrap(), 1);
    }
}
