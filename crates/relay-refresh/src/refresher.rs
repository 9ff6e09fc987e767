//! Platform-specific OAuth token exchange. This module defines the trait the refresh service calls
//! and a generic HTTPS implementation good enough for any provider whose
//! refresh grant follows the standard OAuth2 `refresh_token` shape.

use async_trait::async_trait;
use relay_core::{CredentialBundle, UpstreamAccount};
use serde::Deserialize;
use std::collections::HashMap;

#[async_trait]
pub trait PlatformRefresher: Send + Sync {
    /// Exchanges the account's current refresh token for a new access
    /// token. Implementations must not retry internally.
    async fn refresh(&self, account: &UpstreamAccount) -> Result<CredentialBundle, String>;
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

/// Generic OAuth2 `refresh_token` grant exchanger, one endpoint per
/// platform name (`"claude"`, `"gemini"`, ...).
pub struct HttpOAuthRefresher {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpOAuthRefresher {
    pub fn new(client: reqwest::Client, endpoints: HashMap<String, String>) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl PlatformRefresher for HttpOAuthRefresher {
    async fn refresh(&self, account: &UpstreamAccount) -> Result<CredentialBundle, String> {
        let platform = account.account_type.refresh_platform();
        let endpoint = self
            .endpoints
            .get(platform)
            .ok_or_else(|| format!("no refresh endpoint configured for platform '{platform}'"))?;

        let refresh_token = account
            .credentials
            .refresh_token
            .clone()
            .ok_or_else(|| "account has no refresh token".to_owned())?;

        let response = self
            .client
            .post(endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("token exchange returned {}", response.status()));
        }

        let body: TokenExchangeResponse = response.json().await.map_err(|e| e.to_string())?;

        Ok(CredentialBundle {
            access_token: body.access_token,
            refresh_token: body.refresh_token.or(Some(refresh_token)),
            expires_at: body
                .expires_in
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
            scopes: body
                .scope
                .map(|s| s.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_else(|| account.credentials.scopes.clone()),
        })
    }
}
