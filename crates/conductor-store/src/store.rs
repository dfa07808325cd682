use async_trait::async_trait;

use conductor_core::turns::{ConversationTurn, SessionKey};

use crate::error::StoreError;

/// Pluggable persistence for conversation turns, scoped by session key.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Replace the whole history of a session.
    async fn write(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError>;

    /// Full history, oldest first. Unknown sessions read as empty.
    async fn read(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, StoreError>;

    async fn append(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError>;

    async fn delete(&self, key: &SessionKey) -> Result<(), StoreError>;

    /// The `size` most recent turns, oldest first.
    async fn read_window(
        &self,
        key: &SessionKey,
        size: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let turns = self.read(key).await?;
        Ok(window(turns, size))
    }
}

/// Keep the last `size` turns of `turns`, preserving order.
pub fn window(mut turns: Vec<ConversationTurn>, size: usize) -> Vec<ConversationTurn> {
    if turns.len() > size {
        turns.drain(..turns.len() - size);
    }
    turns
}
