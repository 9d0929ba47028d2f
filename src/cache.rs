use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => at > now,
        }
    }
}

/// Process-wide key/value store with lazy, read-time expiry.
///
/// Expired entries are not swept; they stay in memory until the next `get`
/// for that key, an overwrite, or an explicit `delete`.
pub struct TtlCache<V> {
    inner: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Stores `value` under `key`. A non-positive `ttl_secs` never expires.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl_secs: i64) {
        let expires_at = if ttl_secs > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_secs as u64))
        } else {
            None
        };
        let mut guard = self.inner.write().await;
        guard.insert(key.into(), CacheEntry { value, expires_at });
    }

    pub async fn delete(&self, key: &str) {
        let mut guard = self.inner.write().await;
        guard.remove(key);
    }

    /// Number of physically stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl<V: Clone> TtlCache<V> {
    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let guard = self.inner.read().await;
            match guard.get(key) {
                None => return None,
                Some(entry) if entry.is_live(Instant::now()) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write lock: a writer may have replaced the entry
        // between the two acquisitions.
        let mut guard = self.inner.write().await;
        let now = Instant::now();
        match guard.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }
}
