use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use conductor_core::turns::{ConversationTurn, SessionKey};

use crate::error::StoreError;
use crate::store::MemoryStore;

const KEY_PREFIX: &str = "memory:session:";

/// Key/value cache with per-entry expiry. Values are opaque blobs.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Reset the expiry of an existing entry. False when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// Remaining lifetime, `None` when the key is absent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local cache backend. Expired entries are dropped lazily on access
/// and when the optional entry bound forces an eviction.
#[derive(Default)]
pub struct InProcessCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: Option<usize>,
}

impl InProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: Some(max_entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    fn make_room(&self, incoming: &str) {
        let Some(max) = self.max_entries else {
            return;
        };
        if self.entries.contains_key(incoming) || self.entries.len() < max {
            return;
        }
        if self.purge_expired() > 0 && self.entries.len() < max {
            return;
        }
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(victim) = victim {
            debug!(key = %victim, "evicting cache entry closest to expiry");
            self.entries.remove(&victim);
        }
    }
}

#[async_trait]
impl CacheBackend for InProcessCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let now = Instant::now();
        let hit = self.entries.get(key).map(|e| (e.is_live(now), e.value.clone()));
        match hit {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.make_room(key);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now))
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Low-latency tier: the full turn list of a session as one blob with a TTL.
/// A missing entry reads as an empty history.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn cache_key(key: &SessionKey) -> String {
        format!("{KEY_PREFIX}{}:{}", key.tenant_id, key.session_id)
    }

    pub fn ttl_config(&self) -> Duration {
        self.config.ttl
    }

    /// Extend the entry's lifetime to a full TTL again.
    pub async fn refresh_ttl(&self, key: &SessionKey) -> Result<bool, StoreError> {
        self.backend.expire(&Self::cache_key(key), self.config.ttl).await
    }

    /// Remaining lifetime of the session's entry.
    pub async fn ttl(&self, key: &SessionKey) -> Result<Option<Duration>, StoreError> {
        self.backend.ttl(&Self::cache_key(key)).await
    }

    fn encode(turns: &[ConversationTurn]) -> Result<Bytes, StoreError> {
        Ok(Bytes::from(serde_json::to_vec(turns)?))
    }

    fn decode(blob: &[u8]) -> Result<Vec<ConversationTurn>, StoreError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

#[async_trait]
impl MemoryStore for CacheStore {
    async fn write(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        let blob = Self::encode(turns)?;
        self.backend.set(&Self::cache_key(key), blob, self.config.ttl).await
    }

    async fn read(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, StoreError> {
        match self.backend.get(&Self::cache_key(key)).await? {
            Some(blob) => Self::decode(&blob),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write of the whole blob.
    async fn append(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        let mut existing = self.read(key).await?;
        existing.extend_from_slice(turns);
        self.write(key, &existing).await
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.backend.delete(&Self::cache_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::ids::{SessionId, TenantId};

    fn key() -> SessionKey {
        SessionKey::new(TenantId::from_raw("acme"), SessionId::from_raw("s1"))
    }

    fn store_with_ttl(ttl: Duration) -> CacheStore {
        CacheStore::new(Arc::new(InProcessCache::new()), CacheConfig { ttl })
    }

    #[test]
    fn default_ttl_is_thirty_minutes() {
        assert_eq!(CacheConfig::default().ttl, Duration::from_secs(1800));
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(CacheStore::cache_key(&key()), "memory:session:acme:s1");
    }

    #[tokio::test]
    async fn absent_entry_reads_empty() {
        let store = store_with_ttl(Duration::from_secs(60));
        assert!(store.read(&key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let store = store_with_ttl(Duration::from_secs(60));
        store.write(&key(), &[ConversationTurn::user("hi")]).await.unwrap();
        assert_eq!(store.read(&key()).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.read(&key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_lifetime() {
        let store = store_with_ttl(Duration::from_secs(60));
        store.write(&key(), &[ConversationTurn::user("hi")]).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.refresh_ttl(&key()).await.unwrap());
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(store.read(&key()).await.unwrap().len(), 1);
        let remaining = store.ttl(&key()).await.unwrap().unwrap();
        assert_eq!(remaining, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn append_extends_blob() {
        let store = store_with_ttl(Duration::from_secs(60));
        store.append(&key(), &[ConversationTurn::user("a")]).await.unwrap();
        store.append(&key(), &[ConversationTurn::assistant("b")]).await.unwrap();
        let turns = store.read(&key()).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "b");
    }

    #[tokio::test]
    async fn undecodable_blob_is_an_error() {
        let backend = Arc::new(InProcessCache::new());
        backend
            .set(&CacheStore::cache_key(&key()), Bytes::from_static(b"not json"), Duration::from_secs(5))
            .await
            .unwrap();
        let store = CacheStore::new(backend, CacheConfig::default());
        assert!(matches!(store.read(&key()).await, Err(StoreError::Serialization(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_cache_evicts_soonest_expiring() {
        let cache = InProcessCache::with_max_entries(2);
        cache.set("a", Bytes::from_static(b"1"), Duration::from_secs(10)).await.unwrap();
        cache.set("b", Bytes::from_static(b"2"), Duration::from_secs(100)).await.unwrap();
        cache.set("c", Bytes::from_static(b"3"), Duration::from_secs(100)).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let cache = InProcessCache::new();
        cache.set("short", Bytes::from_static(b"1"), Duration::from_secs(1)).await.unwrap();
        cache.set("long", Bytes::from_static(b"2"), Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.expire("short", Duration::from_secs(5)).await.unwrap());
    }
}
