use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::events::StreamEvent;
use crate::ids::AgentId;
use crate::turns::ConversationTurn;

/// Routing snapshot of an agent. Only used to pick agents for one query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            capabilities: Vec::new(),
        }
    }
}

/// Everything needed to dispatch an agent: its profile plus how it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(flatten)]
    pub profile: AgentProfile,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentDefinition {
    pub fn new(profile: AgentProfile, instruction: impl Into<String>) -> Self {
        Self {
            profile,
            instruction: instruction.into(),
            model: None,
            tools: Vec::new(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.profile.id
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }
}

/// Input to one external agent execution.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub instruction: String,
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub messages: Vec<ConversationTurn>,
}

impl AgentRequest {
    pub fn for_agent(agent: &AgentDefinition, messages: Vec<ConversationTurn>) -> Self {
        Self {
            agent_id: agent.profile.id.clone(),
            agent_name: agent.profile.name.clone(),
            instruction: agent.instruction.clone(),
            model: agent.model.clone(),
            tools: agent.tools.clone(),
            messages,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentReply {
    pub content: String,
}

/// Receives intermediate events (tool calls, tool results, partial messages)
/// while an agent runs. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

/// Sink used when nobody is listening.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: StreamEvent) {}
}

/// The opaque agent-execution capability. How the agent reasons is not our concern.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        request: AgentRequest,
        events: Arc<dyn EventSink>,
    ) -> Result<AgentReply, GatewayError>;
}
