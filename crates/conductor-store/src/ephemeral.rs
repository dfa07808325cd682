use async_trait::async_trait;
use dashmap::DashMap;

use conductor_core::turns::{ConversationTurn, SessionKey};

use crate::error::StoreError;
use crate::store::MemoryStore;

/// In-process store, sharded by session key. Reads hand out copies.
#[derive(Default)]
pub struct EphemeralStore {
    sessions: DashMap<SessionKey, Vec<ConversationTurn>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl MemoryStore for EphemeralStore {
    async fn write(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        self.sessions.insert(key.clone(), turns.to_vec());
        Ok(())
    }

    async fn read(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, StoreError> {
        Ok(self
            .sessions
            .get(key)
            .map(|turns| turns.value().clone())
            .unwrap_or_default())
    }

    async fn append(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        self.sessions
            .entry(key.clone())
            .or_default()
            .extend_from_slice(turns);
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.sessions.remove(key);
        Ok(())
    }

    async fn read_window(
        &self,
        key: &SessionKey,
        size: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        Ok(self
            .sessions
            .get(key)
            .map(|turns| {
                let start = turns.len().saturating_sub(size);
                turns[start..].to_vec()
            })
            .unwrap_or_default())
    }
}
