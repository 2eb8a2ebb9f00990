//! Provider A client (OAuth 2.0 client-credentials grant).
//!
//! The service authenticates as itself; no user redirect is involved. The
//! resulting token is still recorded per user so the user can see and revoke
//! the link.

use super::{http_client, send_json, ProviderError};
use crate::config::ProviderAConfig;
use crate::connections::Provider;
use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Token endpoint response
#[derive(Clone, Deserialize)]
pub struct ClientCredentialsToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for ClientCredentialsToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsToken")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Returns true once `expires_in` seconds have passed since `issued_at`.
///
/// A lifetime past chrono's range never expires, or has always expired if negative.
pub fn is_token_expired(issued_at: DateTime<Utc>, expires_in: i64, now: DateTime<Utc>) -> bool {
    match ChronoDuration::try_seconds(expires_in).and_then(|d| issued_at.checked_add_signed(d)) {
        Some(expires_at) => now >= expires_at,
        None => expires_in < 0,
    }
}

/// Client-credentials client for provider A
pub struct ClientCredentialsClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    oauth_base: String,
    api_base: String,
    scope: String,
}

impl ClientCredentialsClient {
    /// Creates a client from config.
    ///
    /// # Returns
    /// * `Err` - If client id or secret is missing
    pub fn new(config: &ProviderAConfig, timeout: Duration) -> Result<Self> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            bail!("Provider A client credentials are not configured");
        }

        Ok(Self {
            http: http_client(timeout)?,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            oauth_base: config.oauth_base.trim_end_matches('/').to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            scope: config.scope.clone(),
        })
    }

    /// Requests a service access token.
    ///
    /// Exactly one outbound request; no retries.
    pub async fn get_access_token(&self) -> Result<ClientCredentialsToken, ProviderError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        tracing::debug!(provider = %Provider::ProviderA, "Requesting client-credentials token");

        let request = self
            .http
            .post(format!("{}/token", self.oauth_base))
            .form(&form);

        let token: ClientCredentialsToken = send_json(Provider::ProviderA, request).await?;

        tracing::debug!(
            provider = %Provider::ProviderA,
            expires_in = token.expires_in,
            "Client-credentials token issued"
        );

        Ok(token)
    }

    /// Calls a provider A resource endpoint with a bearer token.
    ///
    /// # Arguments
    /// * `endpoint` - Path relative to the API base, e.g. `/api/v1/accounts`
    /// * `method` - HTTP method
    /// * `body` - Optional JSON body
    /// * `access_token` - Token from [`get_access_token`](Self::get_access_token)
    pub async fn call_api<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: reqwest::Method,
        body: Option<&serde_json::Value>,
        access_token: &str,
    ) -> Result<T, ProviderError> {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.api_base, endpoint))
            .bearer_auth(access_token);

        if let Some(body) = body {
            request = request.json(body);
        }

        send_json(Provider::ProviderA, request).await
    }
}
