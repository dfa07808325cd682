use conductor_core::errors::GatewayError;
use conductor_core::ids::AgentId;

use crate::routing::{SubQuestion, WorkflowKind};

/// Outcome of one dispatched agent.
#[derive(Clone, Debug)]
pub struct AgentResult {
    pub agent_id: AgentId,
    pub content: String,
    pub error: Option<GatewayError>,
    pub sub_question: Option<SubQuestion>,
}

impl AgentResult {
    pub fn ok(agent_id: AgentId, content: impl Into<String>) -> Self {
        Self {
            agent_id,
            content: content.into(),
            error: None,
            sub_question: None,
        }
    }

    pub fn failed(agent_id: AgentId, error: GatewayError) -> Self {
        Self {
            agent_id,
            content: String::new(),
            error: Some(error),
            sub_question: None,
        }
    }

    pub fn with_sub_question(mut self, sub_question: Option<SubQuestion>) -> Self {
        self.sub_question = sub_question;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Every AgentResult of one dispatch, in selection order.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub results: Vec<AgentResult>,
    pub workflow: WorkflowKind,
    /// True when at least one agent succeeded.
    pub is_success: bool,
    /// Answer written by a coordinating supervisor, when there was one.
    pub final_answer: Option<String>,
}

impl ExecutionResult {
    pub fn new(results: Vec<AgentResult>, workflow: WorkflowKind) -> Self {
        let is_success = results.iter().any(AgentResult::is_success);
        Self {
            results,
            workflow,
            is_success,
            final_answer: None,
        }
    }

    pub fn with_final_answer(mut self, answer: Option<String>) -> Self {
        self.final_answer = answer;
        self
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.results.iter().map(|r| r.agent_id.clone()).collect()
    }
}
