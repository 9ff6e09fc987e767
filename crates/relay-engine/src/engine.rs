//! Relay engine: ties the key service, scheduler, refresh coordinator, and
//! upstream transport together into the unary and streaming flows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use relay_core::pricing::TokenCounts;
use relay_core::{PricingTable, TenantKey};
use relay_keys::KeyService;
use relay_refresh::TokenRefreshService;
use relay_scheduler::Scheduler;
use relay_storage::KvStore;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::{classify_response, reset_header_name, ResponseClass};
use crate::error::RelayError;
use crate::headers::{
    build_outbound_headers, claude_code_shaped_headers, is_real_claude_code_request,
    session_window_status, HeaderBag,
};
use crate::normalize::{normalize_request, NormalizeOptions};
use crate::session::compute_session_hash;
use crate::stream::{RelayStep, RetryReason, StreamContext};
use crate::transport::{OutboundRequest, UpstreamResponse, UpstreamTransport};
use crate::usage;

pub struct EngineConfig {
    pub upstream_url: String,
    pub api_version: String,
    pub default_beta_header: Option<String>,
    pub proxy_system_prompt: Option<String>,
    pub max_retries: u32,
    pub upstream_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.anthropic.com/v1/messages".to_owned(),
            api_version: "2023-06-01".to_owned(),
            default_beta_header: None,
            proxy_system_prompt: None,
            max_retries: 2,
            upstream_timeout: Duration::from_secs(120),
        }
    }
}

/// The fully resolved outcome of a unary relay attempt, handed back to the
/// HTTP boundary for response construction.
pub struct UnaryOutcome {
    pub status: u16,
    pub headers: HeaderBag,
    pub body: Value,
}

pub struct RelayEngine<S: KvStore> {
    keys: Arc<KeyService<S>>,
    scheduler: Arc<Scheduler<S>>,
    refresh: Arc<TokenRefreshService<S>>,
    transport: Arc<dyn UpstreamTransport>,
    pricing: Arc<dyn PricingTable>,
    config: EngineConfig,
}

impl<S: KvStore> RelayEngine<S> {
    pub fn new(
        keys: Arc<KeyService<S>>,
        scheduler: Arc<Scheduler<S>>,
        refresh: Arc<TokenRefreshService<S>>,
        transport: Arc<dyn UpstreamTransport>,
        pricing: Arc<dyn PricingTable>,
        config: EngineConfig,
    ) -> Self {
        Self {
            keys,
            scheduler,
            refresh,
            transport,
            pricing,
            config,
        }
    }

    fn model_of(body: &Value) -> Option<&str> {
        body.get("model").and_then(Value::as_str)
    }

    /// Rejects the request if `model` isn't in the key's allow-list.
    fn check_model_permission(key: &TenantKey, model: &str) -> Result<(), RelayError> {
        if key.restricted_models.as_ref().is_some_and(|allowed| !allowed.contains(model)) {
            return Err(RelayError::ModelNotPermitted {
                model: model.to_owned(),
            });
        }
        Ok(())
    }

    fn first_system_text(body: &Value) -> Option<&str> {
        body.get("system")
            .and_then(|s| s.as_array().and_then(|a| a.first()).or(Some(s)))
            .and_then(|b| b.as_str().or_else(|| b.get("text").and_then(Value::as_str)))
    }

    fn normalized_body(&self, key: &TenantKey, body: &Value, is_real_claude_code_request: bool) -> Value {
        let model = Self::model_of(body);
        let max_tokens_ceiling = model.and_then(|m| self.pricing.get(m)).and_then(|p| p.max_tokens);

        let _ = key;
        normalize_request(
            body,
            &NormalizeOptions {
                max_tokens_ceiling,
                is_real_claude_code_request,
                proxy_system_prompt: self.config.proxy_system_prompt.as_deref(),
            },
        )
    }

    /// Unary flow.
    pub async fn relay_unary(
        &self,
        key: &TenantKey,
        inbound_headers: &HeaderBag,
        body: Value,
        cancel: &CancellationToken,
    ) -> Result<UnaryOutcome, RelayError> {
        let model = Self::model_of(&body).unwrap_or("").to_owned();
        Self::check_model_permission(key, &model)?;

        let base_session_hash = compute_session_hash(&body);
        let is_real_claude_code = is_real_claude_code_request(inbound_headers.get("user-agent"), Self::first_system_text(&body));
        let normalized = self.normalized_body(key, &body, is_real_claude_code);

        let mut attempt = 0u32;
        let mut last_response: Option<UnaryOutcome> = None;

        loop {
            // Sticky session only applies on the first attempt.
            let session_hash = if attempt == 0 { Some(base_session_hash.as_str()) } else { None };

            let selected = self
                .scheduler
                .select_account_for_key(key, session_hash, Some(&model))
                .await?;

            let account = self
                .scheduler
                .repository()
                .require(&selected.account_id)
                .await?;
            let platform = account.account_type.refresh_platform();
            let credentials = self.refresh.ensure_fresh_token(&selected.account_id, platform).await?;

            let outbound_headers = build_outbound_headers(
                inbound_headers,
                &credentials.access_token,
                &self.config.api_version,
                self.config.default_beta_header.as_deref(),
            );

            let request = OutboundRequest {
                url: self.config.upstream_url.clone(),
                headers: outbound_headers,
                body: normalized.clone(),
                timeout: self.config.upstream_timeout,
            };

            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            let response = tokio::select! {
                result = self.transport.send_unary(&selected.account_id, request) => result?,
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
            };

            let outcome = self
                .classify_and_record_unary(
                    key,
                    &selected.account_id,
                    session_hash,
                    &model,
                    inbound_headers,
                    is_real_claude_code,
                    response,
                )
                .await?;

            let should_retry = matches!(
                outcome.status,
                401 | 403 | 429
            ) || (500..=599).contains(&outcome.status);

            last_response = Some(outcome);
            if !should_retry || attempt >= self.config.max_retries {
                break;
            }
            attempt += 1;
        }

        last_response.ok_or(RelayError::AllAccountsExhausted {
            attempts: self.config.max_retries,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn classify_and_record_unary(
        &self,
        key: &TenantKey,
        account_id: &str,
        session_hash: Option<&str>,
        model: &str,
        inbound_headers: &HeaderBag,
        is_real_claude_code_request: bool,
        response: UpstreamResponse,
    ) -> Result<UnaryOutcome, RelayError> {
        let body_text = String::from_utf8_lossy(&response.body).into_owned();
        let reset_header = response.headers.get(reset_header_name());
        let class = classify_response(response.status, &body_text, reset_header);

        match &class {
            ResponseClass::Success => {
                self.scheduler.record_success_response(account_id).await?;
                if is_real_claude_code_request {
                    self.persist_claude_code_capture(account_id, inbound_headers, &response.headers)
                        .await?;
                }
            }
            ResponseClass::Unauthorized => {
                self.scheduler.record_unauthorized_response(account_id, session_hash).await?;
            }
            ResponseClass::Forbidden => {
                self.scheduler.mark_blocked(account_id, session_hash).await?;
            }
            ResponseClass::RateLimited { reset_at_epoch_secs } => {
                self.mark_rate_limited_from_epoch(account_id, session_hash, *reset_at_epoch_secs).await?;
            }
            ResponseClass::ServerError => {
                self.scheduler.record_server_error_response(account_id, session_hash).await?;
            }
            ResponseClass::Other => {}
        }

        let parsed_body: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);

        if matches!(class, ResponseClass::Success) {
            if let Some((usage_model, counts)) = usage::extract_usage_from_unary_body(&parsed_body) {
                self.record_usage(key, account_id, &usage_model, counts).await?;
            } else {
                warn!(model, account_id, "2xx response carried no usage field; recording an estimated count");
                self.record_usage(key, account_id, model, TokenCounts::default()).await?;
            }
        }

        Ok(UnaryOutcome {
            status: response.status,
            headers: response.headers,
            body: parsed_body,
        })
    }

    /// Writes the Claude-Code fingerprint headers and the upstream's
    /// advisory 5-hour session-window status onto the account record.
    async fn persist_claude_code_capture(
        &self,
        account_id: &str,
        inbound_headers: &HeaderBag,
        response_headers: &HeaderBag,
    ) -> Result<(), RelayError> {
        let Some(mut account) = self.scheduler.repository().get(account_id).await? else {
            return Ok(());
        };
        for (name, value) in claude_code_shaped_headers(inbound_headers) {
            account.captured_headers.insert(name, value);
        }
        if let Some(status) = session_window_status(response_headers) {
            account.session_window_status = Some(status);
        }
        self.scheduler.repository().put(&account).await?;
        Ok(())
    }

    async fn record_usage(
        &self,
        key: &TenantKey,
        account_id: &str,
        model: &str,
        counts: TokenCounts,
    ) -> Result<(), RelayError> {
        let account = self.scheduler.repository().get(account_id).await?;
        let account_type = account.as_ref().map(|a| a.account_type);
        self.keys
            .record_usage(key, self.pricing.as_ref(), model, counts, Some(account_id), account_type)
            .await?;
        Ok(())
    }

    /// Streaming flow. Returns a channel of [`RelayStep`]s;
    /// the HTTP boundary (not part of this crate) drains it and forwards
    /// each `Forwarded` chunk to the inbound client as it arrives.
    pub async fn relay_streaming(
        self: Arc<Self>,
        key: TenantKey,
        inbound_headers: HeaderBag,
        body: Value,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<RelayStep> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(e) = self.drive_streaming(&key, &inbound_headers, body, &cancel, &tx).await {
                warn!(error = %e, "streaming relay ended with an error");
            }
        });
        rx
    }

    #[allow(clippy::too_many_lines)]
    async fn drive_streaming(
        &self,
        key: &TenantKey,
        inbound_headers: &HeaderBag,
        body: Value,
        cancel: &CancellationToken,
        out: &mpsc::Sender<RelayStep>,
    ) -> Result<(), RelayError> {
        let model = Self::model_of(&body).unwrap_or("").to_owned();
        Self::check_model_permission(key, &model)?;

        let base_session_hash = compute_session_hash(&body);
        let is_real_claude_code = is_real_claude_code_request(inbound_headers.get("user-agent"), Self::first_system_text(&body));
        let normalized = self.normalized_body(key, &body, is_real_claude_code);

        let mut attempt = 0u32;
        loop {
            let session_hash = if attempt == 0 { Some(base_session_hash.as_str()) } else { None };
            let selected = self
                .scheduler
                .select_account_for_key(key, session_hash, Some(&model))
                .await?;
            let account = self.scheduler.repository().require(&selected.account_id).await?;
            let platform = account.account_type.refresh_platform();
            let credentials = self.refresh.ensure_fresh_token(&selected.account_id, platform).await?;

            let outbound_headers = build_outbound_headers(
                inbound_headers,
                &credentials.access_token,
                &self.config.api_version,
                self.config.default_beta_header.as_deref(),
            );

            let request = OutboundRequest {
                url: self.config.upstream_url.clone(),
                headers: outbound_headers,
                body: normalized.clone(),
                timeout: self.config.upstream_timeout,
            };

            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            let mut response = tokio::select! {
                result = self.transport.send_streaming(&selected.account_id, request) => result?,
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
            };

            // Early classification before any byte is forwarded.
            if response.status == 401 || response.status == 403 || response.status >= 500 {
                self.handle_early_failure(&selected.account_id, session_hash, response.status).await?;
                if attempt >= self.config.max_retries {
                    return Ok(());
                }
                attempt += 1;
                continue;
            }
            if response.status == 429 {
                let reset_header = response.headers.get(reset_header_name()).and_then(|v| v.parse().ok());
                self.mark_rate_limited_from_epoch(&selected.account_id, session_hash, reset_header).await?;
                if attempt >= self.config.max_retries {
                    return Ok(());
                }
                attempt += 1;
                continue;
            }

            let mut ctx = StreamContext::new();
            let mut retried = false;

            while let Some(chunk) = tokio::select! {
                chunk = response.chunks.recv() => chunk,
                () = cancel.cancelled() => None,
            } {
                if cancel.is_cancelled() {
                    return Err(RelayError::Cancelled);
                }
                let bytes = chunk?;
                for step in ctx.push_chunk(&bytes) {
                    match step {
                        RelayStep::RetryWith(RetryReason::RateLimited { reset_at_epoch_secs }) => {
                            if ctx.has_forwarded_any_byte() {
                                emit_inline_error(out, "upstream-rate-limited").await;
                            } else {
                                self.mark_rate_limited_from_epoch(&selected.account_id, session_hash, reset_at_epoch_secs).await?;
                                retried = true;
                            }
                        }
                        forwarded @ RelayStep::Forwarded(_) => {
                            let _ = out.send(forwarded).await;
                        }
                        RelayStep::Done(_) => {}
                    }
                }
                if retried {
                    break;
                }
            }

            if retried && attempt < self.config.max_retries {
                attempt += 1;
                continue;
            }

            if let RelayStep::Done(Some((usage_model, counts))) = ctx.finish() {
                self.scheduler.record_success_response(&selected.account_id).await?;
                if is_real_claude_code {
                    self.persist_claude_code_capture(&selected.account_id, inbound_headers, &response.headers)
                        .await?;
                }
                self.record_usage(key, &selected.account_id, &usage_model, counts).await?;
                let _ = out.send(RelayStep::Done(Some((usage_model, counts)))).await;
            } else {
                let _ = out.send(RelayStep::Done(None)).await;
            }
            return Ok(());
        }
    }

    async fn handle_early_failure(&self, account_id: &str, session_hash: Option<&str>, status: u16) -> Result<(), RelayError> {
        match status {
            401 => {
                self.scheduler.record_unauthorized_response(account_id, session_hash).await?;
            }
            403 => {
                self.scheduler.mark_blocked(account_id, session_hash).await?;
            }
            _ => {
                self.scheduler.record_server_error_response(account_id, session_hash).await?;
            }
        }
        Ok(())
    }

    async fn mark_rate_limited_from_epoch(
        &self,
        account_id: &str,
        session_hash: Option<&str>,
        reset_epoch_secs: Option<i64>,
    ) -> Result<(), RelayError> {
        let reset_at = reset_epoch_secs
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
        self.scheduler.mark_rate_limited(account_id, session_hash, reset_at).await?;
        Ok(())
    }
}

/// Synthesizes a locally generated `event: error` frame once bytes have
/// already reached the client.
async fn emit_inline_error(out: &mpsc::Sender<RelayStep>, code: &str) {
    let payload = serde_json::json!({
        "type": "error",
        "error": {"code": code, "timestamp": Utc::now().to_rfc3339()},
    });
    let frame = format!("event: error\ndata: {payload}\n\n");
    let _ = out.send(RelayStep::Forwarded(bytes::Bytes::from(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeUpstream;
    use relay_core::pricing::{ModelPricing, StaticPricingTable};
    use relay_core::{AccountStatus, AccountType, CredentialBundle, KeyPermission, UpstreamAccount};
    use relay_keys::KeyServiceConfig;
    use relay_lock::LockCoordinator;
    use relay_refresh::refresher::PlatformRefresher;
    use relay_scheduler::SchedulerConfig;
    use relay_storage::MemoryBackend;
    use std::collections::HashMap;

    struct NeverRefresh;

    #[async_trait::async_trait]
    impl PlatformRefresher for NeverRefresh {
        async fn refresh(&self, account: &UpstreamAccount) -> Result<CredentialBundle, String> {
            Ok(account.credentials.clone())
        }
    }

    fn tenant_key() -> TenantKey {
        TenantKey {
            id: "k1".into(),
            name: "t".into(),
            hashed_secret: "h".into(),
            active: true,
            expires_at: None,
            permissions: KeyPermission::All,
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

    fn account(id: &str) -> UpstreamAccount {
        UpstreamAccount {
            id: id.to_owned(),
            account_type: AccountType::ClaudeOfficial,
            credentials: CredentialBundle {
                access_token: "tok".into(),
                refresh_token: None,
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                scopes: vec![],
            },
            proxy: None,
            active: true,
            status: AccountStatus::Ready,
            schedulable: true,
            unified_user_agent_opt_in: false,
            captured_headers: HashMap::new(),
            session_window_status: None,
        }
    }

    async fn build_engine(
        responder: impl Fn(&str, &OutboundRequest) -> Result<UpstreamResponse, RelayError> + Send + Sync + 'static,
    ) -> (Arc<RelayEngine<MemoryBackend>>, TenantKey) {
        let storage = Arc::new(MemoryBackend::new());
        let scheduler = Arc::new(Scheduler::new(storage.clone(), SchedulerConfig::default()));
        scheduler.repository().put(&account("a1")).await.unwrap();

        let key_service = Arc::new(KeyService::new(
            storage.clone(),
            KeyServiceConfig {
                key_prefix: "sk-relay-".into(),
                key_salt: "salt".into(),
            },
        ));
        let lock = Arc::new(LockCoordinator::new(storage.clone()));
        let refresh = Arc::new(TokenRefreshService::new(lock, scheduler.clone(), Arc::new(NeverRefresh)));
        let transport: Arc<dyn UpstreamTransport> = Arc::new(FakeUpstream::new(responder));
        let pricing: Arc<dyn PricingTable> = Arc::new(
            StaticPricingTable::new().with_entry(
                "claude-3-sonnet",
                ModelPricing {
                    input_per_token: 0.01,
                    output_per_token: 0.02,
                    ..Default::default()
                },
            ),
        );

        let engine = Arc::new(RelayEngine::new(
            key_service,
            scheduler,
            refresh,
            transport,
            pricing,
            EngineConfig::default(),
        ));
        (engine, tenant_key())
    }

    #[tokio::test]
    async fn successful_unary_request_records_usage_and_clears_counters() {
        let (engine, key) = build_engine(|_account, _req| {
            Ok(UpstreamResponse {
                status: 200,
                headers: HeaderBag::new(),
                body: bytes::Bytes::from(
                    serde_json::json!({
                        "model": "claude-3-sonnet",
                        "content": [{"type": "text", "text": "hi"}],
                        "usage": {"input_tokens": 10, "output_tokens": 5}
                    })
                    .to_string(),
                ),
            })
        })
        .await;

        let body = serde_json::json!({
            "model": "claude-3-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 10,
        });
        let outcome = engine
            .relay_unary(&key, &HeaderBag::new(), body, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        let account = engine.scheduler.repository().require("a1").await.unwrap();
        assert_eq!(account.status, AccountStatus::Ready);
    }

    #[tokio::test]
    async fn real_claude_code_request_captures_headers_and_session_window_status() {
        let (engine, key) = build_engine(|_account, _req| {
            let mut headers = HeaderBag::new();
            headers.insert("Anthropic-Unified-5h-Status", "allowed");
            Ok(UpstreamResponse {
                status: 200,
                headers,
                body: bytes::Bytes::from(
                    serde_json::json!({
                        "model": "claude-3-sonnet",
                        "usage": {"input_tokens": 1, "output_tokens": 1}
                    })
                    .to_string(),
                ),
            })
        })
        .await;

        let mut inbound = HeaderBag::new();
        inbound.insert("user-agent", "claude-cli/1.0.0");
        inbound.insert("x-app", "cli");

        let body = serde_json::json!({
            "model": "claude-3-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "system": crate::normalize::CLAUDE_CODE_SYSTEM_TEXT,
        });
        engine.relay_unary(&key, &inbound, body, &CancellationToken::new()).await.unwrap();

        let account = engine.scheduler.repository().require("a1").await.unwrap();
        assert_eq!(account.captured_headers.get("user-agent").map(String::as_str), Some("claude-cli/1.0.0"));
        assert_eq!(account.captured_headers.get("x-app").map(String::as_str), Some("cli"));
        assert_eq!(account.session_window_status.as_deref(), Some("allowed"));
    }

    #[tokio::test]
    async fn unary_response_with_no_usage_field_still_records_usage() {
        let (engine, key) = build_engine(|_account, _req| {
            Ok(UpstreamResponse {
                status: 200,
                headers: HeaderBag::new(),
                body: bytes::Bytes::from(serde_json::json!({"model": "claude-3-sonnet"}).to_string()),
            })
        })
        .await;
        engine.keys.repository().put(&key).await.unwrap();

        let body = serde_json::json!({
            "model": "claude-3-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let outcome = engine
            .relay_unary(&key, &HeaderBag::new(), body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);

        // record_usage ran (with an estimated zero count) rather than being
        // skipped outright, which is observable via the key's last_used_at.
        let updated = engine.keys.repository().get(&key.id).await.unwrap().unwrap();
        assert!(updated.last_used_at.is_some());
    }

    #[tokio::test]
    async fn restricted_model_is_rejected_before_any_upstream_call() {
        let (engine, mut key) = build_engine(|_a, _r| panic!("upstream should not be called")).await;
        key.restricted_models = Some(std::collections::HashSet::from(["claude-3-opus".to_owned()]));

        let body = serde_json::json!({"model": "claude-3-sonnet", "messages": []});
        let err = engine
            .relay_unary(&key, &HeaderBag::new(), body, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ModelNotPermitted { .. }));
    }

    #[tokio::test]
    async fn rate_limited_response_retries_and_succeeds_on_second_account() {
        let storage = Arc::new(MemoryBackend::new());
        let scheduler = Arc::new(Scheduler::new(storage.clone(), SchedulerConfig::default()));
        scheduler.repository().put(&account("a1")).await.unwrap();
        scheduler.repository().put(&account("a2")).await.unwrap();

        let key_service = Arc::new(KeyService::new(
            storage.clone(),
            KeyServiceConfig {
                key_prefix: "sk-relay-".into(),
                key_salt: "salt".into(),
            },
        ));
        let lock = Arc::new(LockCoordinator::new(storage.clone()));
        let refresh = Arc::new(TokenRefreshService::new(lock, scheduler.clone(), Arc::new(NeverRefresh)));

        let transport: Arc<dyn UpstreamTransport> = Arc::new(FakeUpstream::new(move |account_id, _req| {
            if account_id == "a1" {
                Ok(UpstreamResponse {
                    status: 429,
                    headers: HeaderBag::new(),
                    body: bytes::Bytes::from_static(b"{}"),
                })
            } else {
                Ok(UpstreamResponse {
                    status: 200,
                    headers: HeaderBag::new(),
                    body: bytes::Bytes::from(
                        serde_json::json!({"model": "claude-3-sonnet", "usage": {"input_tokens": 1, "output_tokens": 1}})
                            .to_string(),
                    ),
                })
            }
        }));
        let pricing: Arc<dyn PricingTable> = Arc::new(StaticPricingTable::new());
        let engine = RelayEngine::new(key_service, scheduler.clone(), refresh, transport, pricing, EngineConfig::default());

        let body = serde_json::json!({"model": "claude-3-sonnet", "messages": [{"role": "user", "content": "hi"}]});
        let outcome = engine
            .relay_unary(&tenant_key(), &HeaderBag::new(), body, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        let a1 = scheduler.repository().require("a1").await.unwrap();
        assert!(matches!(a1.status, AccountStatus::RateLimited { .. }));
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits_before_upstream_call() {
        let (engine, key) = build_engine(|_a, _r| panic!("upstream should not be called")).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let body = serde_json::json!({"model": "claude-3-sonnet", "messages": [{"role": "user", "content": "hi"}]});
        let err = engine.relay_unary(&key, &HeaderBag::new(), body, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }

    #[tokio::test]
    async fn streaming_request_forwards_lines_and_emits_done() {
        let (engine, key) = build_engine(|_a, _r| {
            let sse = "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-sonnet\",\"usage\":{\"input_tokens\":10}}}\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n";
            Ok(UpstreamResponse {
                status: 200,
                headers: HeaderBag::new(),
                body: bytes::Bytes::from(sse),
            })
        })
        .await;

        let body = serde_json::json!({"model": "claude-3-sonnet", "messages": [{"role": "user", "content": "hi"}], "stream": true});
        let mut rx = engine
            .clone()
            .relay_streaming(key, HeaderBag::new(), body, CancellationToken::new())
            .await;

        let mut forwarded_lines = 0;
        let mut saw_done = false;
        while let Some(step) = rx.recv().await {
            match step {
                RelayStep::Forwarded(_) => forwarded_lines += 1,
                RelayStep::Done(usage) => {
                    saw_done = true;
                    let (_, counts) = usage.unwrap();
                    assert_eq!(counts.input_tokens, 10);
                    assert_eq!(counts.output_tokens, 5);
                }
                RelayStep::RetryWith(_) => panic!("unexpected retry"),
            }
        }
        assert_eq!(forwarded_lines, 2);
        assert!(saw_done);
    }
}
