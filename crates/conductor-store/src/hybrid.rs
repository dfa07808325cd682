use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use conductor_core::turns::{ConversationTurn, SessionKey};

use crate::error::StoreError;
use crate::store::MemoryStore;

/// Cache-aside composition of a fast tier over an authoritative tier.
///
/// Reads try the cache first and fall back to the durable store, warming the
/// cache on the way out. Mutations hit the durable store first; the cache is
/// updated best-effort and its failures are logged, never returned.
pub struct HybridStore {
    cache: Arc<dyn MemoryStore>,
    durable: Arc<dyn MemoryStore>,
}

impl HybridStore {
    pub fn new(cache: Arc<dyn MemoryStore>, durable: Arc<dyn MemoryStore>) -> Self {
        Self { cache, durable }
    }

    /// Overwrite the cache entry with what the durable store holds.
    pub async fn refresh_cache(&self, key: &SessionKey) -> Result<(), StoreError> {
        let turns = self.durable.read(key).await?;
        self.cache.write(key, &turns).await
    }

    async fn warm(&self, key: &SessionKey, turns: &[ConversationTurn]) {
        if let Err(e) = self.cache.write(key, turns).await {
            warn!(session = %key, error = %e, "cache warm failed");
            self.invalidate(key).await;
        }
    }

    /// Drop an entry that may no longer match the durable rows.
    async fn invalidate(&self, key: &SessionKey) {
        if let Err(e) = self.cache.delete(key).await {
            warn!(session = %key, error = %e, "cache invalidate failed");
        }
    }
}

#[async_trait]
impl MemoryStore for HybridStore {
    async fn write(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        self.durable.write(key, turns).await?;
        self.warm(key, turns).await;
        Ok(())
    }

    async fn read(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, StoreError> {
        match self.cache.read(key).await {
            Ok(turns) if !turns.is_empty() => {
                debug!(session = %key, turns = turns.len(), "memory cache hit");
                return Ok(turns);
            }
            Ok(_) => debug!(session = %key, "memory cache miss"),
            Err(e) => warn!(session = %key, error = %e, "cache read failed, using durable store"),
        }

        let turns = self.durable.read(key).await?;
        if !turns.is_empty() {
            self.warm(key, &turns).await;
        }
        Ok(turns)
    }

    /// Only a live cache entry is extended. A cold or unreadable entry is left
    /// for the next read to rebuild from the durable rows, so the cache never
    /// holds a suffix of the history.
    async fn append(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        self.durable.append(key, turns).await?;
        match self.cache.read(key).await {
            Ok(mut cached) if !cached.is_empty() => {
                cached.extend_from_slice(turns);
                if let Err(e) = self.cache.write(key, &cached).await {
                    warn!(session = %key, error = %e, "cache append failed");
                    self.invalidate(key).await;
                }
            }
            Ok(_) => debug!(session = %key, "cache cold, append left to durable store"),
            Err(e) => {
                warn!(session = %key, error = %e, "cache read failed during append");
                self.invalidate(key).await;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), StoreError> {
        if let Err(e) = self.cache.delete(key).await {
            warn!(session = %key, error = %e, "cache delete failed");
        }
        self.durable.delete(key).await
    }

    async fn read_window(
        &self,
        key: &SessionKey,
        size: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let turns = self.read(key).await?;
        Ok(crate::store::window(turns, size))
    }
}
