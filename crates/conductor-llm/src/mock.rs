use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use conductor_core::agent::{AgentExecutor, AgentReply, AgentRequest, EventSink};
use conductor_core::chat::{ChatModel, ChatOptions};
use conductor_core::errors::GatewayError;
use conductor_core::events::StreamEvent;
use conductor_core::ids::AgentId;
use conductor_core::turns::ConversationTurn;

/// Pre-programmed replies for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(GatewayError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    async fn resolve(self) -> Result<String, GatewayError> {
        let mut current = self;
        loop {
            match current {
                Self::Text(text) => return Ok(text),
                Self::Error(e) => return Err(e),
                Self::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

/// Chat model that returns scripted replies in sequence and records prompts.
pub struct MockChatModel {
    replies: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<Vec<ConversationTurn>>>,
    call_count: AtomicUsize,
}

impl MockChatModel {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(MockReply::text).collect())
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<Vec<ConversationTurn>> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        messages: &[ConversationTurn],
        _options: &ChatOptions,
    ) -> Result<String, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(messages.to_vec());

        let reply = self.replies.lock().pop_front();
        match reply {
            Some(reply) => reply.resolve().await,
            None => Err(GatewayError::InvalidRequest(format!(
                "MockChatModel: no reply configured for call {idx}"
            ))),
        }
    }
}

/// Scripted behavior of one agent in [`MockAgent`].
#[derive(Clone, Debug)]
pub struct AgentScript {
    pub reply: MockReply,
    pub events: Vec<StreamEvent>,
}

impl AgentScript {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: MockReply::text(text),
            events: Vec::new(),
        }
    }

    pub fn fail(error: GatewayError) -> Self {
        Self {
            reply: MockReply::Error(error),
            events: Vec::new(),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.reply = MockReply::delayed(delay, self.reply);
        self
    }

    /// Events pushed to the sink before the reply resolves.
    pub fn with_events(mut self, events: Vec<StreamEvent>) -> Self {
        self.events = events;
        self
    }
}

/// Agent executor with one fixed script per agent id.
#[derive(Default)]
pub struct MockAgent {
    scripts: HashMap<AgentId, AgentScript>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agent_id: impl Into<AgentId>, script: AgentScript) -> Self {
        self.scripts.insert(agent_id.into(), script);
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }

    pub fn executed_agents(&self) -> Vec<AgentId> {
        self.requests.lock().iter().map(|r| r.agent_id.clone()).collect()
    }
}

#[async_trait]
impl AgentExecutor for MockAgent {
    async fn execute(
        &self,
        request: AgentRequest,
        events: Arc<dyn EventSink>,
    ) -> Result<AgentReply, GatewayError> {
        self.requests.lock().push(request.clone());
        let script = self.scripts.get(&request.agent_id).cloned().ok_or_else(|| {
            GatewayError::Agent(format!("no script for agent {}", request.agent_id))
        })?;

        for event in script.events {
            events.emit(event);
        }
        let content = script.reply.resolve().await?;
        Ok(AgentReply { content })
    }
}
