use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use conductor_core::chat::{complete_with_cancel, ChatModel, ChatOptions};
use conductor_core::turns::ConversationTurn;

use crate::error::EngineError;
use crate::routing::prompts::SUMMARY_PROMPT;

/// Marks the synthetic assistant turn that replaces compressed history.
pub const SUMMARY_PREFIX: &str = "[Conversation summary]\n";

#[derive(Clone, Debug)]
pub struct SummarizerConfig {
    /// Non-system turns tolerated before compression kicks in.
    pub max_turns_before_summary: usize,
    /// Most recent non-system turns kept verbatim.
    pub recent_turns: usize,
    pub chat_options: ChatOptions,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_turns_before_summary: 20,
            recent_turns: 5,
            chat_options: ChatOptions::default(),
        }
    }
}

/// Compresses old turns into one synopsis through the chat model.
pub struct Summarizer {
    model: Arc<dyn ChatModel>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(model: Arc<dyn ChatModel>, config: SummarizerConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    pub fn should_summarize(&self, turns: &[ConversationTurn]) -> bool {
        let conversational = turns.iter().filter(|t| !t.is_system()).count();
        conversational > self.config.max_turns_before_summary
    }

    /// Returns system turns, then one summary turn, then the recent turns.
    /// Short conversations come back unchanged without a model call.
    #[instrument(skip_all, fields(turns = turns.len()))]
    pub async fn summarize(
        &self,
        turns: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationTurn>, EngineError> {
        let (system, conversation): (Vec<&ConversationTurn>, Vec<&ConversationTurn>) =
            turns.iter().partition(|t| t.is_system());
        if conversation.len() <= self.config.recent_turns {
            return Ok(turns.to_vec());
        }

        let split = conversation.len() - self.config.recent_turns;
        let (older, recent) = conversation.split_at(split);
        let rendered: String = older
            .iter()
            .map(|t| format!("[{}]: {}\n", t.role, t.content))
            .collect();

        let prompt = SUMMARY_PROMPT.replace("{conversation}", &rendered);
        let summary = complete_with_cancel(
            self.model.as_ref(),
            &[ConversationTurn::system(prompt)],
            &self.config.chat_options,
            cancel,
        )
        .await?;
        debug!(older = older.len(), kept = recent.len(), "history compressed");

        let mut out: Vec<ConversationTurn> = system.into_iter().cloned().collect();
        out.push(ConversationTurn::assistant(format!("{SUMMARY_PREFIX}{}", summary.trim())));
        out.extend(recent.iter().map(|t| (*t).clone()));
        Ok(out)
    }
}
