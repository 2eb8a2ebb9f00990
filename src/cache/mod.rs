//! Shared transient key-value cache with per-key TTL.
//!
//! Holds short-lived records owned by different features:
//! - CSRF state records (`oauth:state:{state}`)
//! - idempotency records (`idempotency:{key}`)
//! - plaintext token mirrors (`oauth:{user_id}:{provider}`)
//!
//! All features share one keyspace, so the prefixes in [`keys`] are the only
//! isolation between them and must not change.
//!
//! Two backends implement [`TransientCache`]:
//! - [`MemoryCache`]: in-process DashMap, single-instance deployments and tests
//! - [`RedisCache`]: shared Redis, multi-instance deployments

mod memory;
mod redis_cache;

pub use memory::{run_cache_cleanup, MemoryCache};
pub use redis_cache::RedisCache;

use async_trait::async_trait;
use std::collections::HashMap;

/// Cache backend errors
#[derive(Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Backend unreachable or command failed
    Backend(String),
    /// Key holds a value of another shape (string vs field map)
    WrongType(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Backend(msg) => write!(f, "Cache backend error: {}", msg),
            CacheError::WrongType(key) => write!(f, "Cache key '{}' holds the wrong type", key),
        }
    }
}

impl std::error::Error for CacheError {}

/// Key-value store with TTL and atomic primitives.
///
/// Every call is an I/O suspension point and may fail independently; callers
/// decide whether a failure is fatal.
#[async_trait]
pub trait TransientCache: Send + Sync {
    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Writes a string value that expires after `ttl_seconds` (0 = no expiry).
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CacheError>;

    /// Deletes a key of any shape. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Resets the TTL of an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, CacheError>;

    /// Reads and deletes a string value in one atomic step.
    ///
    /// Of two concurrent callers on the same key at most one gets `Some`.
    async fn take(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Reads every field of a field map. Absent key yields an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    /// Sets fields on a field map, creating it if needed. Existing TTL is kept.
    async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError>;

    /// Creates a field map with `fields` and a TTL only if `key` is absent.
    ///
    /// Returns `true` if this call created it. Atomic across all clients of the
    /// backend: of two concurrent callers exactly one gets `true`.
    async fn hash_create_if_absent(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl_seconds: u64,
    ) -> Result<bool, CacheError>;
}

/// Key namespacing for every feature sharing the cache.
pub mod keys {
    use crate::connections::Provider;

    pub fn idempotency(key: &str) -> String {
        format!("idempotency:{}", key)
    }

    pub fn csrf_state(state: &str) -> String {
        format!("oauth:state:{}", state)
    }

    pub fn token_mirror(user_id: &str, provider: Provider) -> String {
        format!("oauth:{}:{}", user_id, provider.as_str())
    }

}
