//! Uniform namespaced key→bytes cache with TTL.
//!
//! Namespaces: `retrieval`, `embedding`, `llm`, `tts`. Keys are built as
//! `namespace:project:hash`, so invalidation is per-namespace per-project
//! and no operation can read across projects. Expired entries are dropped
//! lazily on read and by a periodic purge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process TTL cache shared by the retriever, LLM cluster and voice
/// manager.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Compose a scoped cache key. `project` may be empty for global
    /// namespaces (LLM completions are shared across projects).
    pub fn key(namespace: &str, project: &str, rest: &str) -> String {
        format!("{}:{}:{}", namespace, project, rest)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        {
            let map = self.inner.read().await;
            match map.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.bytes.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop under the write lock.
        self.inner.write().await.remove(key);
        None
    }

    pub async fn put(&self, key: String, bytes: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = Entry {
            bytes,
            expires_at: Instant::now() + ttl,
        };
        self.inner.write().await.insert(key, entry);
    }

    /// Remove every entry under `namespace:project:`.
    pub async fn invalidate(&self, namespace: &str, project: &str) {
        let prefix = format!("{}:{}:", namespace, project);
        self.inner
            .write()
            .await
            .retain(|k, _| !k.starts_with(&prefix));
    }

    /// Drop all expired entries. Called from a background interval.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.inner.write().await.retain(|_, e| e.expires_at > now);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Spawn the periodic purge task.
    pub fn start_purge_task(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                cache.purge_expired().await;
            }
        })
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = Cache::new();
        let key = Cache::key("retrieval", "demo", "abc");
        cache
            .put(key.clone(), b"hello".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get(&key).await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_expired_entry_not_served() {
        let cache = Cache::new();
        let key = Cache::key("llm", "", "k1");
        cache
            .put(key.clone(), b"x".to_vec(), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_namespace_invalidation_is_project_scoped() {
        let cache = Cache::new();
        let a = Cache::key("retrieval", "alpha", "q");
        let b = Cache::key("retrieval", "beta", "q");
        let c = Cache::key("embedding", "alpha", "q");
        for k in [&a, &b, &c] {
            cache
                .put(k.clone(), b"v".to_vec(), Duration::from_secs(60))
                .await;
        }

        cache.invalidate("retrieval", "alpha").await;

        assert_eq!(cache.get(&a).await, None);
        assert!(cache.get(&b).await.is_some());
        assert!(cache.get(&c).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_drops_expired_only() {
        let cache = Cache::new();
        cache
            .put("a".into(), b"1".to_vec(), Duration::from_millis(5))
            .await;
        cache
            .put("b".into(), b"2".to_vec(), Duration::from_secs(60))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.purge_expired().await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let cache = Cache::new();
        cache.put("k".into(), b"v".to_vec(), Duration::ZERO).await;
        assert_eq!(cache.get("k").await, None);
    }
}
