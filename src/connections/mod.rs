//! Persisted per-user, per-provider OAuth connections.
//!
//! One row per (user, provider). The only write path is an upsert, so a repeated
//! successful exchange overwrites the row instead of adding another one. Token
//! columns hold ciphertext produced by [`crate::crypto::Cipher`]; this module
//! never sees plaintext tokens.

mod storage;

pub use storage::ConnectionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Linked external provider (closed set)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    /// Client-credentials grant, no user redirect
    #[serde(rename = "providerA")]
    ProviderA,
    /// Authorization-code grant with CSRF-protected redirect
    #[serde(rename = "providerB")]
    ProviderB,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::ProviderA, Provider::ProviderB];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::ProviderA => "providerA",
            Provider::ProviderB => "providerB",
        }
    }

    /// Parses a provider tag. Unknown tags yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == tag)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypted token material written on every successful exchange.
#[derive(Clone, Debug)]
pub struct ConnectionFields {
    /// Encrypted access token
    pub access_token: String,
    /// Encrypted refresh token (provider A's grant has none)
    pub refresh_token: Option<String>,
    /// Absolute access token expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Encrypted provider-side subject id (provider B only)
    pub subject_id: Option<String>,
    pub last_sync_at: DateTime<Utc>,
}

/// A stored connection row.
#[derive(Clone, Debug)]
pub struct OAuthConnection {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub subject_id: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthConnection {
    /// A connection without an expiry never reads as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Public view with every token field omitted.
    pub fn summary(&self, now: DateTime<Utc>) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            provider: self.provider,
            expires_at: self.expires_at,
            last_sync_at: self.last_sync_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_expired: self.is_expired(now),
        }
    }
}

/// Connection as exposed over the API
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    pub provider: Provider,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_expired: bool,
}
