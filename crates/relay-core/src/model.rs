//! Entities from the data model: tenant keys, upstream accounts, session
//! affinity mappings, rate-limit windows, and usage events.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{AccountType, Provider};

/// Permission scope granted to a tenant key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPermission {
    Claude,
    Gemini,
    Openai,
    All,
}

impl KeyPermission {
    /// Whether this permission scope admits the given provider.
    pub fn allows(self, provider: Provider) -> bool {
        match self {
            Self::All => true,
            Self::Claude => provider == Provider::Claude,
            Self::Gemini => provider == Provider::Gemini,
            Self::Openai => provider == Provider::OpenAi,
        }
    }
}

/// A tenant-issued credential. The hashed secret is the sole lookup index;
/// the plaintext secret is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantKey {
    pub id: String,
    pub name: String,
    pub hashed_secret: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub permissions: KeyPermission,
    /// Provider-specific account binding, honored before scheduler policy.
    pub bound_accounts: HashMap<Provider, String>,
    pub token_limit: Option<u64>,
    pub concurrency_limit: u32,
    /// Window length in minutes; 0 disables rate limiting.
    pub rate_limit_window_minutes: u32,
    pub rate_limit_requests: u64,
    pub rate_limit_cost: f64,
    pub daily_cost_limit: Option<f64>,
    pub weekly_opus_cost_limit: Option<f64>,
    pub restricted_models: Option<HashSet<String>>,
    pub allowed_clients: Option<HashSet<String>>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl TenantKey {
    /// `active = false` or an elapsed `expires_at` invalidates the key.
    pub fn is_valid_now(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|exp| now <= exp)
    }

    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_window_minutes > 0
    }
}

/// Lifecycle status of an upstream account. Only `Ready` accounts are
/// selectable by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum AccountStatus {
    Ready,
    RateLimited { reset_at: DateTime<Utc> },
    Unauthorized,
    Blocked,
    TempError,
    Refreshing,
}

impl AccountStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether a rate-limited status has elapsed and should logically behave as ready.
    pub fn rate_limit_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::RateLimited { reset_at } => now >= *reset_at,
            _ => false,
        }
    }
}

/// OAuth (or static) credential bundle held by an upstream account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl CredentialBundle {
    /// Token is usable without refresh when `expires_at - now > grace`.
    pub fn is_valid(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match self.expires_at {
            Some(exp) => exp - now > grace,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamAccount {
    pub id: String,
    pub account_type: AccountType,
    pub credentials: CredentialBundle,
    /// Outbound proxy descriptor; `None` means a direct passthrough pool.
    pub proxy: Option<String>,
    pub active: bool,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub unified_user_agent_opt_in: bool,
    /// Headers captured from the most recent real Claude-Code request.
    pub captured_headers: HashMap<String, String>,
    /// Upstream advisory 5-hour quota window status, if ever observed.
    pub session_window_status: Option<String>,
}

impl UpstreamAccount {
    pub fn is_selectable(&self) -> bool {
        self.active && self.schedulable && self.status.is_ready()
    }
}

/// Session-hash to account binding with a bounded TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMapping {
    pub session_hash: String,
    pub account_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-key rate-limit window counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub window_start_epoch_secs: i64,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

impl RateLimitWindow {
    /// Whether `now` has moved past this window, requiring a reset on next increment.
    pub fn is_stale(&self, now_epoch_secs: i64, window_secs: i64) -> bool {
        now_epoch_secs >= self.window_start_epoch_secs + window_secs
    }
}

/// A single usage observation extracted from an upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub key_id: String,
    pub account_id: Option<String>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
    pub ephemeral_5m_tokens: u64,
    pub ephemeral_1h_tokens: u64,
    pub is_long_context: bool,
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(active: bool, expires_at: Option<DateTime<Utc>>) -> TenantKey {
        TenantKey {
            id: "key1".into(),
            name: "test".into(),
            hashed_secret: "deadbeef".into(),
            active,
            expires_at,
            permissions: KeyPermission::All,
            bound_accounts: HashMap::new(),
            token_limit: None,
            concurrency_limit: 0,
            rate_limit_window_minutes: 1,
            rate_limit_requests: 10,
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

    #[test]
    fn inactive_key_is_invalid() {
        let key = sample_key(false, None);
        assert!(!key.is_valid_now(Utc::now()));
    }

    #[test]
    fn expired_key_is_invalid() {
        let key = sample_key(true, Some(Utc::now() - chrono::Duration::seconds(1)));
        assert!(!key.is_valid_now(Utc::now()));
    }

    #[test]
    fn active_unexpired_key_is_valid() {
        let key = sample_key(true, Some(Utc::now() + chrono::Duration::hours(1)));
        assert!(key.is_valid_now(Utc::now()));
    }

    #[test]
    fn permission_scoping() {
        assert!(KeyPermission::All.allows(Provider::Gemini));
        assert!(KeyPermission::Claude.allows(Provider::Claude));
        assert!(!KeyPermission::Claude.allows(Provider::Gemini));
    }

    #[test]
    fn rate_limited_elapses_after_reset() {
        let reset_at = Utc::now() - chrono::Duration::seconds(1);
        let status = AccountStatus::RateLimited { reset_at };
        assert!(status.rate_limit_elapsed(Utc::now()));
        assert!(!AccountStatus::Ready.rate_limit_elapsed(Utc::now()));
    }
}
