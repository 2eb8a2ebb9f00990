//! In-process cache backend.
//!
//! Expiry is checked lazily on every access; [`run_cache_cleanup`] purges
//! entries nobody reads again. DashMap shard locks make each operation atomic
//! within the process.

use super::{CacheError, TransientCache};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
enum Slot {
    Value(String),
    Hash(HashMap<String, String>),
}

#[derive(Clone, Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(slot: Slot, ttl_seconds: u64) -> Self {
        Self {
            slot,
            expires_at: deadline(ttl_seconds),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn deadline(ttl_seconds: u64) -> Option<Instant> {
    (ttl_seconds > 0).then(|| Instant::now() + Duration::from_secs(ttl_seconds))
}

fn hash_from(fields: &[(&str, &str)]) -> HashMap<String, String> {
    fields
        .iter()
        .map(|(f, v)| (f.to_string(), v.to_string()))
        .collect()
}

/// DashMap-backed [`TransientCache`].
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on a live entry; an expired one is evicted and reads as absent.
    fn read<R>(&self, key: &str, f: impl FnOnce(&Slot) -> R) -> Option<R> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(f(&entry.slot)),
            Some(_) => {}
            None => return None,
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaining TTL of a live key, `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[async_trait]
impl TransientCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.read(key, |slot| slot.clone()) {
            Some(Slot::Value(value)) => Ok(Some(value)),
            Some(Slot::Hash(_)) => Err(CacheError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry::new(Slot::Value(value.to_string()), ttl_seconds),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = deadline(ttl_seconds);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        // Only string values are consumed; a field map stays in place
        let removed = self
            .entries
            .remove_if(key, |_, entry| matches!(entry.slot, Slot::Value(_)));

        match removed {
            Some((_, entry)) if entry.is_expired(now) => Ok(None),
            Some((_, Entry { slot: Slot::Value(value), .. })) => Ok(Some(value)),
            Some(_) => Ok(None),
            None => match self.read(key, |slot| matches!(slot, Slot::Hash(_))) {
                Some(true) => Err(CacheError::WrongType(key.to_string())),
                _ => Ok(None),
            },
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        match self.read(key, |slot| slot.clone()) {
            Some(Slot::Hash(fields)) => Ok(fields),
            Some(Slot::Value(_)) => Err(CacheError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Entry::new(Slot::Hash(hash_from(fields)), 0));
                    return Ok(());
                }
                match &mut occupied.get_mut().slot {
                    Slot::Hash(existing) => {
                        existing.extend(hash_from(fields));
                        Ok(())
                    }
                    Slot::Value(_) => Err(CacheError::WrongType(key.to_string())),
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(Slot::Hash(hash_from(fields)), 0));
                Ok(())
            }
        }
    }

    async fn hash_create_if_absent(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl_seconds: u64,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let fresh = Entry::new(Slot::Hash(hash_from(fields)), ttl_seconds);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }
}

/// Background task to periodically purge expired entries
pub async fn run_cache_cleanup(cache: MemoryCache, interval_seconds: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        cache.purge_expired();
        tracing::debug!("Cache cleanup complete, {} entries remaining", cache.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();

        cache.set("k", "v", 60).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        assert!(cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_value_reads_absent() {
        let cache = MemoryCache::new();
        cache.set("k", "v", 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let cache = MemoryCache::new();
        cache.set("state", "u1", 300).await.unwrap();

        assert_eq!(cache.take("state").await.unwrap(), Some("u1".to_string()));
        assert_eq!(cache.take("state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_take_has_one_winner() {
        let cache = MemoryCache::new();
        cache.set("state", "u1", 300).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.take("state").await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_hash_create_if_absent() {
        let cache = MemoryCache::new();

        let created = cache
            .hash_create_if_absent("h", &[("status", "in-progress")], 60)
            .await
            .unwrap();
        assert!(created);

        let again = cache
            .hash_create_if_absent("h", &[("status", "other")], 60)
            .await
            .unwrap();
        assert!(!again);

        let fields = cache.hash_get_all("h").await.unwrap();
        assert_eq!(fields.get("status").map(String::as_str), Some("in-progress"));
        assert!(cache.ttl("h").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_create_has_one_winner() {
        let cache = MemoryCache::new();

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let marker = i.to_string();
                cache
                    .hash_create_if_absent("h", &[("owner", marker.as_str())], 60)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_hash_set_keeps_ttl_and_merges() {
        let cache = MemoryCache::new();
        cache
            .hash_create_if_absent("h", &[("status", "in-progress"), ("fingerprint", "abc")], 60)
            .await
            .unwrap();

        cache.hash_set("h", &[("status", "done")]).await.unwrap();

        let fields = cache.hash_get_all("h").await.unwrap();
        assert_eq!(fields["status"], "done");
        assert_eq!(fields["fingerprint"], "abc");
        assert!(cache.ttl("h").is_some());
    }

    #[tokio::test]
    async fn test_expire_resets_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "v", 1).await.unwrap();

        assert!(cache.expire("k", 600).await.unwrap());
        assert!(cache.ttl("k").unwrap() > Duration::from_secs(500));

        assert!(!cache.expire("missing", 600).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let cache = MemoryCache::new();
        cache.set("s", "v", 60).await.unwrap();
        cache.hash_set("h", &[("f", "v")]).await.unwrap();

        assert!(matches!(cache.hash_get_all("s").await, Err(CacheError::WrongType(_))));
        assert!(matches!(cache.get("h").await, Err(CacheError::WrongType(_))));
        assert!(matches!(cache.take("h").await, Err(CacheError::WrongType(_))));
        // The field map survives a failed take
        assert_eq!(cache.hash_get_all("h").await.unwrap()["f"], "v");
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.set("short", "v", 1).await.unwrap();
        cache.set("long", "v", 600).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        cache.purge_expired();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long").await.unwrap(), Some("v".to_string()));
    }
}
