//! Process configuration for the relay server.
//!
//! Everything is read once at startup into [`RelayConfig`] and shared via
//! application state; nothing here is re-read per request.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// Storage backend selection (`RELAY_STORAGE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// In-memory (development/tests only, data lost on restart).
    Memory,
    /// Redis, via `relay_storage::RedisBackend` (feature `redis`).
    Redis,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend to construct at startup.
    pub storage_backend: StorageBackendKind,
    /// Salt mixed into the tenant-key secret hash. A random salt is
    /// generated and logged as a startup warning when `API_KEY_SALT` is
    /// unset; every previously issued key hash stops validating the moment
    /// that happens, so production deployments must set it explicitly.
    pub api_key_salt: String,
    /// Log level filter (e.g. `info`, `debug`, `warn`).
    pub log_level: String,
    /// Upstream provider URL the relay engine forwards to.
    pub claude_api_url: String,
    /// `anthropic-version` header value sent on every outbound request.
    pub claude_api_version: String,
    /// Upstream dial/read timeout.
    pub proxy_timeout: Duration,
    /// Maximum number of account switches per request before giving up.
    pub max_retries: u32,
    /// Consecutive 401s from an account before it is marked unauthorized.
    pub unauthorized_threshold: i64,
    /// Consecutive 5xxs from an account before it is marked temporarily errored.
    pub temp_error_threshold: i64,
    /// TTL of a sticky-session → account mapping.
    pub session_ttl: Duration,
    /// Maximum accepted inbound request body size.
    pub request_body_limit_bytes: usize,
}

impl RelayConfig {
    /// Loads configuration from the environment, following this codebase's
    /// parse-or-default discipline: a value that fails to parse is logged
    /// at `warn` and replaced with the default; an absent value is silently
    /// defaulted. The one exception is `API_KEY_SALT`, whose default is a
    /// freshly generated value logged at `warn` rather than a fixed
    /// constant, since a fixed fallback would be a shared secret baked into
    /// every unconfigured deployment.
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = resolve_bind_addr();

        let storage_backend = match std::env::var("RELAY_STORAGE") {
            Ok(v) if v.eq_ignore_ascii_case("redis") => StorageBackendKind::Redis,
            Ok(v) if v.eq_ignore_ascii_case("memory") => StorageBackendKind::Memory,
            Ok(other) => {
                warn!(value = %other, "unsupported RELAY_STORAGE value; falling back to memory");
                StorageBackendKind::Memory
            }
            Err(_) => StorageBackendKind::Memory,
        };

        let api_key_salt = std::env::var("API_KEY_SALT").unwrap_or_else(|_| {
            let generated = uuid::Uuid::new_v4().to_string();
            warn!(
                "API_KEY_SALT is not set; generated a random salt for this process only. \
                 Every issued key hash will stop validating on restart — set API_KEY_SALT \
                 explicitly in any deployment that persists keys across restarts."
            );
            generated
        });

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let claude_api_url = std::env::var("CLAUDE_API_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_owned());

        let claude_api_version =
            std::env::var("CLAUDE_API_VERSION").unwrap_or_else(|_| "2023-06-01".to_owned());

        let proxy_timeout = parse_env_or("PROXY_TIMEOUT", 120, Duration::from_secs);
        let max_retries = parse_env_or("RELAY_MAX_RETRIES", 2, |v| v);
        let unauthorized_threshold = parse_env_or("RELAY_UNAUTHORIZED_THRESHOLD", 1, |v| v);
        let temp_error_threshold = parse_env_or("RELAY_TEMP_ERROR_THRESHOLD", 10, |v| v);
        let session_ttl = parse_env_or("RELAY_SESSION_TTL_SECS", 900, Duration::from_secs);
        let request_body_limit_bytes =
            parse_env_or("RELAY_REQUEST_BODY_LIMIT_BYTES", 1024 * 1024, |v: u64| v as usize);

        Self {
            bind_addr,
            storage_backend,
            api_key_salt,
            log_level,
            claude_api_url,
            claude_api_version,
            proxy_timeout,
            max_retries,
            unauthorized_threshold,
            temp_error_threshold,
            session_ttl,
            request_body_limit_bytes,
        }
    }
}

/// `RELAY_BIND_ADDR` wins outright; otherwise `PORT` (platform convention)
/// overrides the port segment of the `0.0.0.0:8787` default.
fn resolve_bind_addr() -> SocketAddr {
    if let Ok(addr) = std::env::var("RELAY_BIND_ADDR") {
        return addr.parse().unwrap_or_else(|_| {
            warn!(value = %addr, "invalid RELAY_BIND_ADDR; falling back to default");
            default_bind_addr()
        });
    }

    if let Ok(port_str) = std::env::var("PORT") {
        return match port_str.parse::<u16>() {
            Ok(port) => SocketAddr::from(([0, 0, 0, 0], port)),
            Err(_) => {
                warn!(value = %port_str, "invalid PORT; falling back to default");
                default_bind_addr()
            }
        };
    }

    default_bind_addr()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8787))
}

fn parse_env_or<T, U>(name: &str, default: T, convert: impl FnOnce(T) -> U) -> U
where
    T: std::str::FromStr + Copy,
{
    let value = match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(variable = name, value = %raw, "failed to parse environment variable; using default");
                default
            }
        },
        Err(_) => default,
    };
    convert(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_addr_is_all_interfaces_on_8787() {
        assert_eq!(default_bind_addr(), SocketAddr::from(([0, 0, 0, 0], 8787)));
    }
}
