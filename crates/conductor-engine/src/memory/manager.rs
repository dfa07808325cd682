use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use conductor_core::turns::{ConversationTurn, SessionKey};
use conductor_store::MemoryStore;

use crate::error::EngineError;

use super::summarizer::Summarizer;

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Most recent turns presented to a model as context.
    pub window_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { window_size: 10 }
    }
}

/// Conversation memory as the orchestration layer sees it: one store, a
/// context window, and optional compression of long histories.
pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    config: MemoryConfig,
    summarizer: Option<Arc<Summarizer>>,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, config: MemoryConfig) -> Self {
        Self {
            store,
            config,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Full, unwindowed history.
    pub async fn history(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, EngineError> {
        Ok(self.store.read(key).await?)
    }

    /// At most `window_size` most recent turns, oldest first.
    pub async fn windowed_history(
        &self,
        key: &SessionKey,
    ) -> Result<Vec<ConversationTurn>, EngineError> {
        Ok(self.store.read_window(key, self.config.window_size).await?)
    }

    /// System turn (if any), then the windowed history, then the new user turn.
    pub async fn build_context_messages(
        &self,
        key: &SessionKey,
        system_prompt: Option<&str>,
        user_message: &str,
    ) -> Result<Vec<ConversationTurn>, EngineError> {
        let history = self.windowed_history(key).await?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            messages.push(ConversationTurn::system(prompt));
        }
        messages.extend(history);
        messages.push(ConversationTurn::user(user_message));
        Ok(messages)
    }

    pub async fn add_turn(&self, key: &SessionKey, turn: ConversationTurn) -> Result<(), EngineError> {
        self.add_turns(key, &[turn]).await
    }

    pub async fn add_turns(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), EngineError> {
        Ok(self.store.append(key, turns).await?)
    }

    pub async fn add_user_turn(&self, key: &SessionKey, content: &str) -> Result<(), EngineError> {
        self.add_turn(key, ConversationTurn::user(content)).await
    }

    pub async fn add_assistant_turn(&self, key: &SessionKey, content: &str) -> Result<(), EngineError> {
        self.add_turn(key, ConversationTurn::assistant(content)).await
    }

    pub async fn clear_history(&self, key: &SessionKey) -> Result<(), EngineError> {
        Ok(self.store.delete(key).await?)
    }

    /// Compress the stored history when it has grown past the summarizer's
    /// threshold. Returns whether the history was rewritten.
    #[instrument(skip(self, cancel), fields(session = %key))]
    pub async fn summarize_if_needed(
        &self,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(false);
        };
        let turns = self.store.read(key).await?;
        if !summarizer.should_summarize(&turns) {
            return Ok(false);
        }
        let compressed = summarizer.summarize(&turns, cancel).await?;
        self.store.write(key, &compressed).await?;
        info!(before = turns.len(), after = compressed.len(), "history summarized");
        Ok(true)
    }
}
