//! CSRF state records for the authorization-code redirect.
//!
//! A state value is a random v4 UUID rendered as 32 hex characters. Records live
//! in the shared cache under `oauth:state:{state}` and are consumed with an
//! atomic read-and-delete, so a state can be redeemed once.

use crate::cache::{keys, CacheError, TransientCache};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Payload stored under a state value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub user_id: String,
}

/// Issues and redeems CSRF state values
#[derive(Clone)]
pub struct CsrfStateStore {
    cache: Arc<dyn TransientCache>,
    ttl_seconds: u64,
}

impl CsrfStateStore {
    /// # Arguments
    /// * `ttl_seconds` - How long an unredeemed state stays valid (300 = 5 minutes)
    pub fn new(cache: Arc<dyn TransientCache>, ttl_seconds: u64) -> Self {
        Self { cache, ttl_seconds }
    }

    /// Generates a state value and records which user started the flow.
    pub async fn create_state(&self, user_id: &str) -> Result<String, CacheError> {
        let state = Uuid::new_v4().simple().to_string();
        let record = StateRecord {
            user_id: user_id.to_string(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| CacheError::Backend(format!("Failed to encode state record: {}", e)))?;

        self.cache
            .set(&keys::csrf_state(&state), &value, self.ttl_seconds)
            .await?;

        Ok(state)
    }

    /// Redeems a state value.
    ///
    /// Returns `None` for a state that was never issued, was already redeemed,
    /// or expired; callers cannot tell these apart.
    pub async fn validate_and_consume(&self, state: &str) -> Result<Option<StateRecord>, CacheError> {
        let Some(raw) = self.cache.take(&keys::csrf_state(state)).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<StateRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed state record");
                Ok(None)
            }
        }
    }
}
