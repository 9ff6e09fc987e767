//! Redis-backed [`KvStore`] (feature `redis`), built on `fred`.
//!
//! Connects using `REDIS_HOST` / `REDIS_PORT` / `REDIS_PASSWORD`. The
//! atomic primitives (`compare_and_delete`, `incr_rate_limit_window`) are
//! implemented as Lua scripts evaluated server-side via `EVAL`, which is
//! exactly what lock release and window resets are built on.

use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;

use crate::{KvStore, StorageError, WindowCounters};

/// `KEYS[1]` = lock key, `ARGV[1]` = expected owner token.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `KEYS[1..4]` = window_start, requests, tokens, cost keys.
/// `ARGV` = window_secs, now_epoch_secs, requests_inc, tokens_inc, cost_inc.
const WINDOW_INCR_SCRIPT: &str = r#"
local window_secs = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local req_inc = tonumber(ARGV[3])
local tok_inc = tonumber(ARGV[4])
local cost_inc = tonumber(ARGV[5])

local start = tonumber(redis.call("GET", KEYS[1]))
local stale = (start == nil) or (now >= start + window_secs)

local requests, tokens, cost
if stale then
    start = now
    requests = req_inc
    tokens = tok_inc
    cost = cost_inc
else
    requests = tonumber(redis.call("GET", KEYS[2]) or "0") + req_inc
    tokens = tonumber(redis.call("GET", KEYS[3]) or "0") + tok_inc
    cost = tonumber(redis.call("GET", KEYS[4]) or "0") + cost_inc
end

redis.call("SET", KEYS[1], tostring(start))
redis.call("SET", KEYS[2], tostring(requests))
redis.call("SET", KEYS[3], tostring(tokens))
redis.call("SET", KEYS[4], tostring(cost))

return {tostring(start), tostring(requests), tostring(tokens), tostring(cost)}
"#;

pub struct RedisBackend {
    client: RedisClient,
}

impl RedisBackend {
    /// Connect using `REDIS_HOST`/`REDIS_PORT`/`REDIS_PASSWORD`.
    pub async fn connect() -> Result<Self, StorageError> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());
        let port: u16 = std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379);
        let password = std::env::var("REDIS_PASSWORD").ok();

        let mut config = RedisConfig::from_url(&format!("redis://{host}:{port}"))
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        config.password = password;

        let client = RedisClient::new(config, None, None, None);
        client
            .connect()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        client
            .wait_for_connect()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.client
            .get(key)
            .await
            .map_err(|e| StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expire = ttl.map(|d| Expiration::EX(d.as_secs() as i64));
        self.client
            .set::<(), _, _>(key, value, expire, None, false)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let expire = ttl.map(|d| Expiration::EX(d.as_secs() as i64));
        let result: Option<String> = self
            .client
            .set(key, value, expire, Some(SetOptions::NX), true)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(result.is_some())
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StorageError> {
        self.client
            .incr_by(key, amount)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64, StorageError> {
        self.client
            .incr_by_float(key, amount)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.client
            .expire(key, ttl.as_secs() as i64, None)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        let deleted: i64 = self.client.del(key).await.map_err(|e| StorageError::Delete {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(deleted > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let secs: i64 = self.client.ttl(key).await.map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.client
            .keys(pattern)
            .await
            .map_err(|e| StorageError::List {
                pattern: pattern.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.client
            .hget(key, field)
            .await
            .map_err(|e| StorageError::Read {
                key: format!("{key}.{field}"),
                reason: e.to_string(),
            })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.client
            .hset(key, (field, value))
            .await
            .map_err(|e| StorageError::Write {
                key: format!("{key}.{field}"),
                reason: e.to_string(),
            })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let deleted: i64 = self
            .client
            .eval(COMPARE_AND_DELETE_SCRIPT, vec![key.to_owned()], vec![expected.to_owned()])
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(deleted > 0)
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

        let keys = vec![
            StorageKey::rate_limit_window_start(key_id),
            StorageKey::rate_limit_requests(key_id),
            StorageKey::rate_limit_tokens(key_id),
            StorageKey::rate_limit_cost(key_id),
        ];
        let args = vec![
            window_secs.to_string(),
            now_epoch_secs.to_string(),
            requests_inc.to_string(),
            tokens_inc.to_string(),
            cost_inc.to_string(),
        ];

        let result: Vec<String> = self
            .client
            .eval(WINDOW_INCR_SCRIPT, keys, args)
            .await
            .map_err(|e| StorageError::Write {
                key: format!("rate_limit:*:{key_id}"),
                reason: e.to_string(),
            })?;

        let parse_i64 = |s: &str| s.parse().unwrap_or(0);
        let parse_u64 = |s: &str| s.parse().unwrap_or(0);
        let parse_f64 = |s: &str| s.parse().unwrap_or(0.0);

        Ok(WindowCounters {
            window_start_epoch_secs: parse_i64(&result[0]),
            requests: parse_u64(&result[1]),
            tokens: parse_u64(&result[2]),
            cost: parse_f64(&result[3]),
        })
    }
}
