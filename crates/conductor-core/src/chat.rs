use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;
use crate::turns::ConversationTurn;

/// Options controlling a single completion.
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// The chat-completion capability: rendered prompt turns in, free text out.
/// Output carries no structural guarantee; callers must tolerate malformed text.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: &ChatOptions,
    ) -> Result<String, GatewayError>;
}

/// Run a completion, aborting with `Cancelled` as soon as `cancel` fires.
pub async fn complete_with_cancel(
    model: &dyn ChatModel,
    messages: &[ConversationTurn],
    options: &ChatOptions,
    cancel: &CancellationToken,
) -> Result<String, GatewayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = model.complete(messages, options) => result,
    }
}
