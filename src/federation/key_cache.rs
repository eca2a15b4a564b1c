//! Public key cache
//!
//! Caches fetched remote actor public keys to avoid refetching the actor
//! document on every inbound activity. Entries expire after a configurable
//! TTL; verification failures should invalidate so a rotated remote key is
//! refetched promptly.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CacheEntry {
    public_key_pem: String,
    fetched_at: Instant,
}

/// TTL cache for remote actor public keys, keyed by key ID.
pub struct PublicKeyCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get a cached key if present and fresh.
    pub async fn get(&self, key_id: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(key_id)?;

        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.public_key_pem.clone())
    }

    /// Store a freshly fetched key.
    pub async fn put(&self, key_id: &str, public_key_pem: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key_id.to_string(),
            CacheEntry {
                public_key_pem: public_key_pem.to_string(),
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop a cached key, forcing a refetch on next use.
    pub async fn invalidate(&self, key_id: &str) {
        self.entries.write().await.remove(key_id);
    }

    /// Sweep expired entries. Run periodically from a background task.
    pub async fn evict_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.fetched_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_fresh_key() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache
            .put("https://remote.example/users/bob#main-key", "PEM")
            .await;

        assert_eq!(
            cache.get("https://remote.example/users/bob#main-key").await,
            Some("PEM".to_string())
        );
        assert_eq!(cache.get("https://remote.example/users/carol#main-key").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_missed_and_swept() {
        let cache = PublicKeyCache::new(Duration::from_millis(0));
        cache
            .put("https://remote.example/users/bob#main-key", "PEM")
            .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("https://remote.example/users/bob#main-key").await, None);

        cache.evict_expired().await;
        assert!(cache.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache
            .put("https://remote.example/users/bob#main-key", "PEM")
            .await;
        cache
            .invalidate("https://remote.example/users/bob#main-key")
            .await;

        assert_eq!(cache.get("https://remote.example/users/bob#main-key").await, None);
    }
}
