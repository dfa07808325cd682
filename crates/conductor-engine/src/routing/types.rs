use std::fmt;

use serde::{Deserialize, Serialize};

use conductor_core::agent::AgentProfile;
use conductor_core::ids::{AgentId, SessionId, TenantId};

/// Execution topology chosen for a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Single,
    Parallel,
    Sequential,
    /// Reserved. Executed as `Sequential`.
    Hierarchical,
    /// Reserved. Executed as `Sequential`.
    Pipeline,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Single => "single",
            WorkflowKind::Parallel => "parallel",
            WorkflowKind::Sequential => "sequential",
            WorkflowKind::Hierarchical => "hierarchical",
            WorkflowKind::Pipeline => "pipeline",
        }
    }

    /// Whether agents run one after another under a supervisor.
    pub fn is_chained(&self) -> bool {
        matches!(
            self,
            WorkflowKind::Sequential | WorkflowKind::Hierarchical | WorkflowKind::Pipeline
        )
    }

    /// Kinds a model is allowed to pick.
    pub fn is_selectable(&self) -> bool {
        matches!(
            self,
            WorkflowKind::Single | WorkflowKind::Parallel | WorkflowKind::Sequential
        )
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A piece of a decomposed query, routed to one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQuestion {
    #[serde(default)]
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub intent: String,
    pub assigned_agent_id: AgentId,
}

/// Routing decision for one query. Produced once, consumed once by the dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysisResult {
    #[serde(default)]
    pub selected_agent_ids: Vec<AgentId>,
    #[serde(default)]
    pub selection_reasoning: String,
    pub workflow: WorkflowKind,
    #[serde(default)]
    pub workflow_reasoning: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub is_complex: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_questions: Vec<SubQuestion>,
}

impl QueryAnalysisResult {
    /// An empty selection means the user asked for a human.
    pub fn is_escalation(&self) -> bool {
        self.selected_agent_ids.is_empty()
    }

    pub fn is_fallback(&self) -> bool {
        self.selection_reasoning.starts_with("fallback")
    }
}

/// Inputs to one analysis call.
#[derive(Clone, Debug)]
pub struct AnalysisContext {
    pub tenant_id: TenantId,
    pub session_id: Option<SessionId>,
    pub user_id: Option<String>,
    pub query: String,
    pub available_agents: Vec<AgentProfile>,
}

impl AnalysisContext {
    pub fn new(tenant_id: TenantId, query: impl Into<String>, agents: Vec<AgentProfile>) -> Self {
        Self {
            tenant_id,
            session_id: None,
            user_id: None,
            query: query.into(),
            available_agents: agents,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn first_agent(&self) -> Option<&AgentId> {
        self.available_agents.first().map(|a| &a.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_wire_names() {
        let kind: WorkflowKind = serde_json::from_str("\"parallel\"").unwrap();
        assert_eq!(kind, WorkflowKind::Parallel);
        assert_eq!(serde_json::to_string(&WorkflowKind::Pipeline).unwrap(), "\"pipeline\"");
        assert!(serde_json::from_str::<WorkflowKind>("\"swarm\"").is_err());
    }

    #[test]
    fn reserved_kinds_run_chained_but_are_not_selectable() {
        assert!(WorkflowKind::Hierarchical.is_chained());
        assert!(WorkflowKind::Pipeline.is_chained());
        assert!(!WorkflowKind::Hierarchical.is_selectable());
        assert!(!WorkflowKind::Parallel.is_chained());
    }

    #[test]
    fn analysis_result_tolerates_missing_optional_fields() {
        let raw = r#"{"selected_agent_ids": ["a"], "workflow": "single"}"#;
        let parsed: QueryAnalysisResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.selected_agent_ids, vec![AgentId::from_raw("a")]);
        assert!(parsed.sub_questions.is_empty());
        assert_eq!(parsed.confidence_score, 0.0);
    }
}
