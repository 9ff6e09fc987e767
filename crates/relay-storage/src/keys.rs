//! Logical key layout.

/// Builders for the stable key names every component agrees on.
pub struct StorageKey;

impl StorageKey {
    pub fn apikey(id: &str) -> String {
        format!("apikey:{id}")
    }

    pub fn apikey_hash_index(hashed_secret: &str) -> String {
        format!("apikey:hash:{hashed_secret}")
    }

    pub fn usage_total_tokens(key_id: &str) -> String {
        format!("usage:{key_id}:total:tokens")
    }

    pub fn usage_total(key_id: &str) -> String {
        format!("usage:{key_id}:total")
    }

    pub fn usage_model(key_id: &str, model: &str) -> String {
        format!("usage:{key_id}:model:{model}")
    }

    pub fn rate_limit_requests(key_id: &str) -> String {
        format!("rate_limit:requests:{key_id}")
    }

    pub fn rate_limit_tokens(key_id: &str) -> String {
        format!("rate_limit:tokens:{key_id}")
    }

    pub fn rate_limit_cost(key_id: &str) -> String {
        format!("rate_limit:cost:{key_id}")
    }

    pub fn rate_limit_window_start(key_id: &str) -> String {
        format!("rate_limit:window_start:{key_id}")
    }

    pub fn concurrency(key_id: &str) -> String {
        format!("concurrency:{key_id}")
    }

    pub fn daily_cost(key_id: &str, date: &str) -> String {
        format!("daily_cost:{key_id}:{date}")
    }

    pub fn weekly_opus_cost(key_id: &str, week: &str) -> String {
        format!("weekly_opus_cost:{key_id}:{week}")
    }

    pub fn claude_account(id: &str) -> String {
        format!("claude_account:{id}")
    }

    pub fn account_401_errors(id: &str) -> String {
        format!("claude_account:{id}:401_errors")
    }

    pub fn account_5xx_errors(id: &str) -> String {
        format!("claude_account:{id}:5xx_errors")
    }

    pub fn session(hash: &str) -> String {
        format!("session:{hash}")
    }

    pub fn token_refresh_lock(platform: &str, account_id: &str) -> String {
        format!("token_refresh_lock:{platform}:{account_id}")
    }

    pub fn claude_code_user_agent_daily() -> &'static str {
        "claude_code_user_agent:daily"
    }
}
