//! Wire-level clients for the two linked providers.
//!
//! - [`ClientCredentialsClient`] (provider A): service credentials, no user redirect
//! - [`AuthCodeClient`] (provider B): authorization code + refresh token, signed resource calls
//!
//! Clients are built once at startup from explicit config; missing credentials
//! fail construction instead of failing a request later.

mod auth_code;
mod client_credentials;

pub use auth_code::{
    generate_tran_dtime, Account, AccountListResponse, AuthCodeClient, AuthCodeToken,
    InquiryType, Transaction, TransactionListResponse,
};
pub use client_credentials::{is_token_expired, ClientCredentialsClient, ClientCredentialsToken};

use crate::connections::Provider;
use crate::redact;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Provider call failures
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Request never produced a response (DNS, connect, TLS, timeout)
    Transport {
        provider: Provider,
        message: String,
        timed_out: bool,
    },
    /// Provider answered with a non-2xx status
    Upstream {
        provider: Provider,
        status: u16,
        body: String,
    },
    /// 2xx response whose body did not match the expected shape
    Decode { provider: Provider, message: String },
}

impl ProviderError {
    pub fn provider(&self) -> Provider {
        match self {
            ProviderError::Transport { provider, .. }
            | ProviderError::Upstream { provider, .. }
            | ProviderError::Decode { provider, .. } => *provider,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Transport { timed_out: true, .. })
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transport {
                provider, message, ..
            } => write!(f, "{} request failed: {}", provider, message),
            ProviderError::Upstream {
                provider,
                status,
                body,
            } => write!(
                f,
                "{} responded with status {}: {}",
                provider,
                status,
                redact::mask_body(body.as_bytes())
            ),
            ProviderError::Decode { provider, message } => {
                write!(f, "{} response could not be decoded: {}", provider, message)
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Builds the shared HTTP client with the configured timeout.
pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))
}

/// Sends a request and decodes a JSON body, keeping transport, status and
/// decode failures apart.
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: Provider,
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| ProviderError::Transport {
            provider,
            message: e.to_string(),
            timed_out: e.is_timeout(),
        })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| ProviderError::Transport {
        provider,
        message: format!("Failed to read response body: {}", e),
        timed_out: e.is_timeout(),
    })?;

    if !status.is_success() {
        return Err(ProviderError::Upstream {
            provider,
            status: status.as_u16(),
            body,
        });
    }

    // serde messages can quote field values, so only the location is kept
    serde_json::from_str(&body).map_err(|e| ProviderError::Decode {
        provider,
        message: format!(
            "{:?} error at line {} column {}",
            e.classify(),
            e.line(),
            e.column()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_status_and_body() {
        let err = ProviderError::Upstream {
            provider: Provider::ProviderB,
            status: 401,
            body: "{\"rsp_code\":\"O0001\"}".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("providerB"));
        assert!(rendered.contains("401"));
        assert!(rendered.contains("O0001"));
        assert_eq!(err.provider(), Provider::ProviderB);
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_error_display_masks_secrets_in_body() {
        let err = ProviderError::Upstream {
            provider: Provider::ProviderA,
            status: 400,
            body: r#"{"error":"invalid_grant","access_token":"leaked-token"}"#.to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("invalid_grant"));
        assert!(rendered.contains(redact::MASK));
        assert!(!rendered.contains("leaked-token"));

        let err = ProviderError::Upstream {
            provider: Provider::ProviderA,
            status: 502,
            body: "<html>bad gateway</html>".to_string(),
        };
        assert!(!err.to_string().contains("bad gateway"));
    }

    #[test]
    fn test_timeout_flag() {
        let err = ProviderError::Transport {
            provider: Provider::ProviderA,
            message: "operation timed out".to_string(),
            timed_out: true,
        };
        assert!(err.is_timeout());
    }
}
