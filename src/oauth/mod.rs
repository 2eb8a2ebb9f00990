//! OAuth connection orchestration.
//!
//! Drives the two provider flows to one persisted outcome:
//! - client-credentials (provider A): the service authenticates itself, no redirect
//! - authorization code (provider B): CSRF-protected redirect, then code exchange
//!
//! Every connect runs the same ordered steps: provider exchange, encrypt,
//! upsert, cache mirror. A failing step stops the ones after it, so a cache
//! mirror never exists without its stored row. Mirror writes are best effort;
//! the stored row is the source of truth.

mod errors;
mod state;

pub use errors::{
    describe_error, CallbackError, CallbackErrorCode, ConnectError, ErrorDescription,
};
pub use state::{CsrfStateStore, StateRecord};

use crate::cache::{keys, TransientCache};
use crate::connections::{
    ConnectionFields, ConnectionStore, ConnectionSummary, OAuthConnection, Provider,
};
use crate::crypto::Cipher;
use crate::providers::{AuthCodeClient, AuthCodeToken, ClientCredentialsClient, ProviderError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plaintext token mirror kept in the cache for `expires_in` seconds
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenMirror {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_seq_no: Option<String>,
}

/// Result of a successful connect
#[derive(Clone, Debug)]
pub struct ConnectOutcome {
    pub connection: OAuthConnection,
    /// Access token lifetime reported by the provider, in seconds
    pub expires_in: i64,
}

/// Decrypted credentials for downstream resource calls
#[derive(Clone)]
pub struct ConnectionTokens {
    pub access_token: String,
    pub subject_id: Option<String>,
}

/// OAuth orchestrator
pub struct OAuthService {
    cache: Arc<dyn TransientCache>,
    store: Arc<ConnectionStore>,
    cipher: Cipher,
    provider_a: ClientCredentialsClient,
    provider_b: AuthCodeClient,
    states: CsrfStateStore,
}

impl OAuthService {
    pub fn new(
        cache: Arc<dyn TransientCache>,
        store: Arc<ConnectionStore>,
        cipher: Cipher,
        provider_a: ClientCredentialsClient,
        provider_b: AuthCodeClient,
        state_ttl_seconds: u64,
    ) -> Self {
        let states = CsrfStateStore::new(Arc::clone(&cache), state_ttl_seconds);
        Self {
            cache,
            store,
            cipher,
            provider_a,
            provider_b,
            states,
        }
    }

    /// Provider B client, for downstream resource calls.
    pub fn auth_code_client(&self) -> &AuthCodeClient {
        &self.provider_b
    }

    /// Provider A client, for downstream resource calls.
    pub fn client_credentials_client(&self) -> &ClientCredentialsClient {
        &self.provider_a
    }

    /// Flow A: issues a provider A token and records it for `user_id`.
    pub async fn connect_client_credentials(
        &self,
        user_id: &str,
    ) -> Result<ConnectOutcome, ConnectError> {
        let token = self.provider_a.get_access_token().await?;
        let expires_at = expiry_after(Provider::ProviderA, token.expires_in)?;

        let fields = ConnectionFields {
            access_token: self.seal(&token.access_token)?,
            refresh_token: None,
            expires_at: Some(expires_at),
            subject_id: None,
            last_sync_at: Utc::now(),
        };

        let connection = self
            .store
            .upsert(user_id, Provider::ProviderA, &fields)
            .map_err(ConnectError::Store)?;

        self.mirror(
            user_id,
            Provider::ProviderA,
            TokenMirror {
                access_token: token.access_token,
                user_seq_no: None,
            },
            token.expires_in,
        )
        .await;

        info!(user_id = %user_id, provider = %Provider::ProviderA, "OAuth connection saved");

        Ok(ConnectOutcome {
            connection,
            expires_in: token.expires_in,
        })
    }

    /// Flow B, step 1: records a CSRF state for `user_id` and returns the
    /// provider authorization URL carrying it.
    pub async fn begin_authorization(&self, user_id: &str) -> Result<String, ConnectError> {
        let state = self.states.create_state(user_id).await?;
        let url = self.provider_b.authorization_url(&state);

        info!(user_id = %user_id, provider = %Provider::ProviderB, "Authorization started");

        Ok(url)
    }

    /// Flow B, step 2: redeems `state`, exchanges `code` and records the tokens.
    ///
    /// The state is consumed before the exchange starts, so a replayed callback
    /// fails even while the first one is still running.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
    ) -> Result<ConnectOutcome, CallbackError> {
        let record = self
            .states
            .validate_and_consume(state)
            .await
            .map_err(CallbackError::StateLookup)?
            .ok_or(CallbackError::InvalidState)?;

        let token = self
            .provider_b
            .exchange_code(code)
            .await
            .map_err(ConnectError::from)?;

        let outcome = self.save_auth_code_token(&record.user_id, token).await?;

        info!(
            user_id = %record.user_id,
            provider = %Provider::ProviderB,
            "OAuth connection saved"
        );

        Ok(outcome)
    }

    /// Refreshes provider B tokens for `user_id` from the stored refresh token.
    ///
    /// Returns `Ok(None)` when there is no provider B connection or it holds no
    /// refresh token.
    pub async fn refresh_connection(
        &self,
        user_id: &str,
    ) -> Result<Option<ConnectOutcome>, ConnectError> {
        let Some(connection) = self
            .store
            .find(user_id, Provider::ProviderB)
            .map_err(ConnectError::Store)?
        else {
            return Ok(None);
        };

        let Some(sealed) = connection.refresh_token.as_deref() else {
            return Ok(None);
        };
        let refresh_token = self.open(sealed)?;

        let mut token = self.provider_b.refresh_access_token(&refresh_token).await?;

        // A refresh response may omit fields the original exchange returned
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token);
        }
        if token.user_seq_no.is_none() {
            if let Some(sealed) = connection.subject_id.as_deref() {
                token.user_seq_no = Some(self.open(sealed)?);
            }
        }

        let outcome = self.save_auth_code_token(user_id, token).await?;
        info!(user_id = %user_id, provider = %Provider::ProviderB, "OAuth connection refreshed");
        Ok(Some(outcome))
    }

    /// Deletes the stored connection and its cache mirror.
    ///
    /// # Returns
    /// * `Ok(true)` - Connection deleted
    /// * `Ok(false)` - User had no connection for this provider
    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<bool, ConnectError> {
        let deleted = self
            .store
            .delete(user_id, provider)
            .map_err(ConnectError::Store)?;

        if let Err(e) = self.cache.delete(&keys::token_mirror(user_id, provider)).await {
            warn!(
                user_id = %user_id,
                provider = %provider,
                error = %e,
                "Failed to drop token mirror"
            );
        }

        if deleted {
            info!(user_id = %user_id, provider = %provider, "OAuth connection deleted");
        }

        Ok(deleted)
    }

    /// Lists a user's connections without token fields.
    pub fn list_connections(&self, user_id: &str) -> Result<Vec<ConnectionSummary>, ConnectError> {
        let now = Utc::now();
        let connections = self
            .store
            .find_many(user_id)
            .map_err(ConnectError::Store)?;

        Ok(connections.iter().map(|c| c.summary(now)).collect())
    }

    /// Plaintext credentials for a connection.
    ///
    /// Reads the cache mirror first and falls back to decrypting the stored row.
    /// An expired stored token is still returned; check `expires_at` on the row.
    pub async fn connection_tokens(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<ConnectionTokens>, ConnectError> {
        match self.cache.get(&keys::token_mirror(user_id, provider)).await {
            Ok(Some(raw)) => match serde_json::from_str::<TokenMirror>(&raw) {
                Ok(mirror) => {
                    debug!(user_id = %user_id, provider = %provider, "Token mirror hit");
                    return Ok(Some(ConnectionTokens {
                        access_token: mirror.access_token,
                        subject_id: mirror.user_seq_no,
                    }));
                }
                Err(e) => warn!(provider = %provider, error = %e, "Ignoring malformed token mirror"),
            },
            Ok(None) => {}
            Err(e) => warn!(provider = %provider, error = %e, "Token mirror read failed"),
        }

        let Some(connection) = self
            .store
            .find(user_id, provider)
            .map_err(ConnectError::Store)?
        else {
            return Ok(None);
        };

        let subject_id = match connection.subject_id.as_deref() {
            Some(sealed) => Some(self.open(sealed)?),
            None => None,
        };

        Ok(Some(ConnectionTokens {
            access_token: self.open(&connection.access_token)?,
            subject_id,
        }))
    }

    async fn save_auth_code_token(
        &self,
        user_id: &str,
        token: AuthCodeToken,
    ) -> Result<ConnectOutcome, ConnectError> {
        let expires_at = expiry_after(Provider::ProviderB, token.expires_in)?;

        let refresh_token = match token.refresh_token.as_deref() {
            Some(rt) => Some(self.seal(rt)?),
            None => None,
        };
        let subject_id = match token.user_seq_no.as_deref() {
            Some(seq) => Some(self.seal(seq)?),
            None => None,
        };

        let fields = ConnectionFields {
            access_token: self.seal(&token.access_token)?,
            refresh_token,
            expires_at: Some(expires_at),
            subject_id,
            last_sync_at: Utc::now(),
        };

        let connection = self
            .store
            .upsert(user_id, Provider::ProviderB, &fields)
            .map_err(ConnectError::Store)?;

        self.mirror(
            user_id,
            Provider::ProviderB,
            TokenMirror {
                access_token: token.access_token,
                user_seq_no: token.user_seq_no,
            },
            token.expires_in,
        )
        .await;

        Ok(ConnectOutcome {
            connection,
            expires_in: token.expires_in,
        })
    }

    /// Writes the plaintext mirror. Failures are logged, never returned.
    async fn mirror(&self, user_id: &str, provider: Provider, mirror: TokenMirror, expires_in: i64) {
        // A zero TTL would mean "never expires"
        let Ok(ttl) = u64::try_from(expires_in) else {
            return;
        };
        if ttl == 0 {
            return;
        }

        let value = match serde_json::to_string(&mirror) {
            Ok(v) => v,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Failed to encode token mirror");
                return;
            }
        };

        if let Err(e) = self
            .cache
            .set(&keys::token_mirror(user_id, provider), &value, ttl)
            .await
        {
            warn!(
                user_id = %user_id,
                provider = %provider,
                error = %e,
                "Failed to write token mirror"
            );
        }
    }

    fn seal(&self, plaintext: &str) -> Result<String, ConnectError> {
        self.cipher.encrypt(plaintext).map_err(ConnectError::Crypto)
    }

    fn open(&self, sealed: &str) -> Result<String, ConnectError> {
        self.cipher.decrypt(sealed).map_err(ConnectError::Crypto)
    }
}

/// Absolute expiry of a token that lives `expires_in` seconds from now.
///
/// A lifetime chrono cannot represent is a malformed provider response.
fn expiry_after(provider: Provider, expires_in: i64) -> Result<DateTime<Utc>, ProviderError> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| ProviderError::Decode {
            provider,
            message: format!("expires_in {} is out of range", expires_in),
        })
}

#[cfg(test)]
mod tests;
