//! Orchestrator failures and the error codes carried by redirect flows.

use crate::cache::CacheError;
use crate::providers::ProviderError;
use serde::Serialize;

/// Failure of a connect, disconnect or lookup operation.
///
/// Whatever step failed, no later step ran.
#[derive(Debug)]
pub enum ConnectError {
    /// Provider exchange failed; nothing was persisted
    Provider(ProviderError),
    /// Connection store failed
    Store(anyhow::Error),
    /// Encryption or decryption failed
    Crypto(anyhow::Error),
    /// Cache failed where a cache write was required
    Cache(CacheError),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Provider(e) => write!(f, "Provider exchange failed: {}", e),
            ConnectError::Store(e) => write!(f, "Connection store error: {:#}", e),
            ConnectError::Crypto(e) => write!(f, "Token encryption error: {:#}", e),
            ConnectError::Cache(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<ProviderError> for ConnectError {
    fn from(e: ProviderError) -> Self {
        ConnectError::Provider(e)
    }
}

impl From<CacheError> for ConnectError {
    fn from(e: CacheError) -> Self {
        ConnectError::Cache(e)
    }
}

/// Failure of the authorization-code callback.
#[derive(Debug)]
pub enum CallbackError {
    /// State never issued, already consumed, or expired
    InvalidState,
    /// State lookup itself failed
    StateLookup(CacheError),
    Connect(ConnectError),
}

impl CallbackError {
    /// Opaque code placed on the error redirect.
    pub fn code(&self) -> CallbackErrorCode {
        match self {
            CallbackError::InvalidState => CallbackErrorCode::InvalidState,
            CallbackError::StateLookup(_) => CallbackErrorCode::CallbackFailed,
            CallbackError::Connect(ConnectError::Provider(e)) => match e {
                ProviderError::Transport { timed_out: true, .. } => CallbackErrorCode::Timeout,
                ProviderError::Transport { .. } => CallbackErrorCode::NetworkError,
                ProviderError::Upstream { .. } | ProviderError::Decode { .. } => {
                    CallbackErrorCode::TokenExchangeFailed
                }
            },
            CallbackError::Connect(_) => CallbackErrorCode::CallbackFailed,
        }
    }
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackError::InvalidState => write!(f, "Invalid or expired state"),
            CallbackError::StateLookup(e) => write!(f, "State lookup failed: {}", e),
            CallbackError::Connect(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CallbackError {}

impl From<ConnectError> for CallbackError {
    fn from(e: ConnectError) -> Self {
        CallbackError::Connect(e)
    }
}

/// Error codes the callback emits on its error redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackErrorCode {
    InvalidState,
    Timeout,
    TokenExchangeFailed,
    NetworkError,
    CallbackFailed,
}

impl CallbackErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackErrorCode::InvalidState => "invalid_state",
            CallbackErrorCode::Timeout => "timeout",
            CallbackErrorCode::TokenExchangeFailed => "token_exchange_failed",
            CallbackErrorCode::NetworkError => "network_error",
            CallbackErrorCode::CallbackFailed => "callback_failed",
        }
    }
}

impl std::fmt::Display for CallbackErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable reason for an error destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDescription {
    pub error: String,
    pub title: String,
    pub description: String,
}

/// Classifies any error code, ours or one forwarded from the provider.
///
/// Matching is by substring, first match wins: timeout, CSRF/state,
/// token/authentication, network. Anything else keeps the raw code as its
/// description.
pub fn describe_error(code: Option<&str>) -> ErrorDescription {
    let code = code.map(str::trim).filter(|c| !c.is_empty());
    let Some(code) = code else {
        return ErrorDescription {
            error: "unknown".to_string(),
            title: "Unknown error".to_string(),
            description: "Something went wrong while connecting your account.".to_string(),
        };
    };

    let lower = code.to_lowercase();
    let (title, description) = if lower.contains("timeout") || lower.contains("time out") {
        (
            "Request timed out",
            "The request took too long. Check your network connection and try again.",
        )
    } else if lower.contains("csrf") || lower.contains("state") {
        (
            "Security check failed",
            "The security token did not match. Please start the connection again.",
        )
    } else if lower.contains("token") || lower.contains("authentication") {
        (
            "Authentication failed",
            "The provider could not authenticate this connection. Please sign in again.",
        )
    } else if lower.contains("network") || lower.contains("fetch") {
        (
            "Network error",
            "The server could not be reached. Check your internet connection.",
        )
    } else {
        ("Connection failed", code)
    };

    ErrorDescription {
        error: code.to_string(),
        title: title.to_string(),
        description: description.to_string(),
    }
}
