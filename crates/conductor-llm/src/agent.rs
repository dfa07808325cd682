use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use conductor_core::agent::{AgentExecutor, AgentReply, AgentRequest, EventSink};
use conductor_core::chat::{ChatModel, ChatOptions};
use conductor_core::errors::GatewayError;
use conductor_core::events::StreamEvent;
use conductor_core::turns::ConversationTurn;

/// Prompt-only agent: the agent's instruction becomes the system turn and a
/// single completion is the reply. Tool sets are not executed.
pub struct ChatAgent {
    model: Arc<dyn ChatModel>,
}

impl ChatAgent {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl AgentExecutor for ChatAgent {
    async fn execute(
        &self,
        request: AgentRequest,
        events: Arc<dyn EventSink>,
    ) -> Result<AgentReply, GatewayError> {
        if !request.tools.is_empty() {
            debug!(agent_id = %request.agent_id, tools = request.tools.len(), "tools ignored by prompt-only agent");
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.instruction.is_empty() {
            messages.push(ConversationTurn::system(request.instruction.clone()));
        }
        messages.extend(request.messages);

        let options = ChatOptions {
            model: request.model,
            ..Default::default()
        };
        let content = self.model.complete(&messages, &options).await?;
        events.emit(StreamEvent::message(request.agent_name, content.clone()));
        Ok(AgentReply { content })
    }
}
