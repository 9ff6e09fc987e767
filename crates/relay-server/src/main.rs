//! Relay server entry point.
//!
//! Bootstraps the storage backend, scheduler, key service, lock coordinator,
//! token-refresh service, per-account connection pools, and the relay
//! engine, then starts the Axum HTTP server with graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use relay_core::pricing::{ModelPricing, StaticPricingTable};
use relay_core::{PricingTable, Provider};
use relay_engine::{EngineConfig, RelayEngine};
use relay_engine::transport::{HttpUpstreamTransport, UpstreamTransport};
use relay_keys::{KeyService, KeyServiceConfig};
use relay_lock::LockCoordinator;
use relay_pool::ConnectionPool;
use relay_refresh::refresher::HttpOAuthRefresher;
use relay_refresh::TokenRefreshService;
use relay_scheduler::{Scheduler, SchedulerConfig};
use relay_storage::{KvStore, MemoryBackend};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use relay_server::config::{RelayConfig, StorageBackendKind};
use relay_server::routes;
use relay_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, addr = %config.bind_addr, "relay server starting");

    match config.storage_backend {
        StorageBackendKind::Memory => {
            run(Arc::new(MemoryBackend::new()), config).await
        }
        StorageBackendKind::Redis => {
            #[cfg(feature = "redis")]
            {
                let backend = relay_storage::RedisBackend::connect()
                    .await
                    .context("failed to connect to redis")?;
                run(Arc::new(backend), config).await
            }
            #[cfg(not(feature = "redis"))]
            {
                anyhow::bail!("RELAY_STORAGE=redis requested but feature 'redis' is not enabled");
            }
        }
    }
}

/// Builds every subsystem against one concrete storage backend and serves
/// the HTTP surface until a shutdown signal arrives.
async fn run<S: KvStore + 'static>(storage: Arc<S>, config: RelayConfig) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new(
        storage.clone(),
        SchedulerConfig {
            session_ttl: config.session_ttl,
            unauthorized_threshold: config.unauthorized_threshold,
            temp_error_threshold: config.temp_error_threshold,
        },
    ));

    let key_service = Arc::new(KeyService::new(
        storage.clone(),
        KeyServiceConfig {
            key_prefix: "sk-relay-".to_owned(),
            key_salt: config.api_key_salt.clone(),
        },
    ));

    let lock = Arc::new(LockCoordinator::new(storage.clone()));
    let refresh = Arc::new(TokenRefreshService::new(
        lock,
        scheduler.clone(),
        Arc::new(oauth_refresher()),
    ));

    let transport: Arc<dyn UpstreamTransport> =
        Arc::new(HttpUpstreamTransport::new(build_pools(&scheduler).await?));

    let pricing: Arc<dyn PricingTable> = Arc::new(default_pricing_table());

    let engine = Arc::new(RelayEngine::new(
        key_service.clone(),
        scheduler.clone(),
        refresh,
        transport,
        pricing.clone(),
        EngineConfig {
            upstream_url: config.claude_api_url.clone(),
            api_version: config.claude_api_version.clone(),
            default_beta_header: None,
            proxy_system_prompt: None,
            max_retries: config.max_retries,
            upstream_timeout: config.proxy_timeout,
        },
    ));

    let state = Arc::new(AppState {
        keys: key_service,
        scheduler,
        engine,
        pricing,
        config: config.clone(),
    });

    let app = routes::router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "relay server listening");

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("relay server stopped");
    Ok(())
}

/// Builds the OAuth token refresher. Real refresh endpoints are supplied
/// per-platform via `RELAY_OAUTH_ENDPOINT_<PLATFORM>` (e.g.
/// `RELAY_OAUTH_ENDPOINT_CLAUDE`); a deployment that never refreshes tokens
/// out-of-band can leave all of these unset, in which case refresh attempts
/// fail with a clear "no refresh endpoint configured" error rather than
/// silently doing nothing.
fn oauth_refresher() -> HttpOAuthRefresher {
    let mut endpoints = HashMap::new();
    for (platform, var) in [
        ("claude", "RELAY_OAUTH_ENDPOINT_CLAUDE"),
        ("gemini", "RELAY_OAUTH_ENDPOINT_GEMINI"),
        ("bedrock", "RELAY_OAUTH_ENDPOINT_BEDROCK"),
        ("openai", "RELAY_OAUTH_ENDPOINT_OPENAI"),
    ] {
        if let Ok(endpoint) = std::env::var(var) {
            endpoints.insert(platform.to_owned(), endpoint);
        }
    }
    HttpOAuthRefresher::new(reqwest::Client::new(), endpoints)
}

/// One [`ConnectionPool`] per upstream account already on record, indexed
/// by account id. New accounts registered after startup get a pool lazily
/// the first time the scheduler selects them is out of scope here — account
/// provisioning is an external collaborator.
async fn build_pools<S: KvStore + 'static>(
    scheduler: &Scheduler<S>,
) -> anyhow::Result<HashMap<String, Arc<ConnectionPool>>> {
    let mut pools = HashMap::new();
    for provider in [Provider::Claude, Provider::Gemini, Provider::Bedrock, Provider::OpenAi] {
        let accounts = scheduler.repository().candidates_for_provider(provider).await?;
        for account in accounts {
            let pool = Arc::new(ConnectionPool::new(account.id.clone(), account.proxy.clone()));
            pools.insert(account.id, pool);
        }
    }
    Ok(pools)
}

/// Placeholder pricing seed: a real deployment plugs in its own loader
/// behind [`PricingTable`].
fn default_pricing_table() -> StaticPricingTable {
    StaticPricingTable::new()
        .with_entry(
            "claude-3-5-sonnet-20241022",
            ModelPricing {
                input_per_token: 3.0 / 1_000_000.0,
                output_per_token: 15.0 / 1_000_000.0,
                cache_create_per_token: 3.75 / 1_000_000.0,
                cache_read_per_token: 0.3 / 1_000_000.0,
                ephemeral_5m_per_token: 3.75 / 1_000_000.0,
                ephemeral_1h_per_token: 6.0 / 1_000_000.0,
                max_tokens: Some(8_192),
            },
        )
        .with_entry(
            "claude-3-opus-20240229",
            ModelPricing {
                input_per_token: 15.0 / 1_000_000.0,
                output_per_token: 75.0 / 1_000_000.0,
                cache_create_per_token: 18.75 / 1_000_000.0,
                cache_read_per_token: 1.5 / 1_000_000.0,
                ephemeral_5m_per_token: 18.75 / 1_000_000.0,
                ephemeral_1h_per_token: 30.0 / 1_000_000.0,
                max_tokens: Some(4_096),
            },
        )
        .with_entry(
            "claude-3-haiku-20240307",
            ModelPricing {
                input_per_token: 0.25 / 1_000_000.0,
                output_per_token: 1.25 / 1_000_000.0,
                cache_create_per_token: 0.3 / 1_000_000.0,
                cache_read_per_token: 0.03 / 1_000_000.0,
                ephemeral_5m_per_token: 0.3 / 1_000_000.0,
                ephemeral_1h_per_token: 0.5 / 1_000_000.0,
                max_tokens: Some(4_096),
            },
        )
}

/// Waits for `SIGINT` or `SIGTERM`, then broadcasts shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
