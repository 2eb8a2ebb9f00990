//! Redis cache backend.
//!
//! Atomicity comes from Redis itself: `GETDEL` for single-use reads and a Lua
//! script for create-if-absent, so concurrent API instances never both win.

use super::{CacheError, TransientCache};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;

/// Creates the field map and its TTL only when the key does not exist.
///
/// KEYS[1] = key, ARGV[1] = ttl seconds, ARGV[2..] = field/value pairs
const CREATE_HASH_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 1
"#;

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.kind() == redis::ErrorKind::TypeError {
            CacheError::WrongType(e.to_string())
        } else {
            CacheError::Backend(e.to_string())
        }
    }
}

/// `Redis`-backed [`TransientCache`].
///
/// Cheap to clone; clones share one `ConnectionManager`, which reconnects on
/// its own after the server comes back.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    create_hash_script: Script,
}

impl RedisCache {
    /// Connects to Redis.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the first connection fails.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Redis connection manager: {}", e))?;

        tracing::info!("Redis cache connected");

        Ok(Self {
            conn_manager,
            create_hash_script: Script::new(CREATE_HASH_IF_ABSENT),
        })
    }
}

#[async_trait]
impl TransientCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        if ttl_seconds == 0 {
            let _: () = conn.set(key, value).await?;
        } else {
            // SETEX is atomic: SET + EXPIRE in one command
            let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let seconds = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let applied: bool = conn.expire(key, seconds).await?;
        Ok(applied)
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        // GETDEL: concurrent consumers see exactly one value
        Ok(conn.get_del(key).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hash_create_if_absent(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl_seconds: u64,
    ) -> Result<bool, CacheError> {
        if fields.is_empty() || ttl_seconds == 0 {
            return Err(CacheError::Backend(
                "create-if-absent needs at least one field and a positive TTL".to_string(),
            ));
        }

        let mut conn = self.conn_manager.clone();
        let mut invocation = self.create_hash_script.prepare_invoke();
        invocation.key(key).arg(ttl_seconds);
        for (field, value) in fields {
            invocation.arg(*field).arg(*value);
        }

        let created: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(created == 1)
    }
}
