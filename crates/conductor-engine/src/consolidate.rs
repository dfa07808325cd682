use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conductor_core::chat::{complete_with_cancel, ChatModel, ChatOptions};
use conductor_core::ids::AgentId;
use conductor_core::turns::ConversationTurn;

use crate::error::EngineError;
use crate::execution::ExecutionResult;
use crate::extract::decode_object;
use crate::routing::prompts::{
    CONFLICT_DETECTION_SYSTEM_PROMPT, CONFLICT_DETECTION_USER_PROMPT, CONSOLIDATION_SYSTEM_PROMPT,
    CONSOLIDATION_USER_PROMPT,
};
use crate::routing::WorkflowKind;

/// Returned when no agent produced anything usable.
pub const NO_RESULT_APOLOGY: &str =
    "Sorry, I couldn't retrieve the information you asked for right now.";

const MERGE_DIVIDER: &str = "\n\n---\n\n";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConflictInfo {
    pub detected: bool,
    pub description: String,
    pub agent_ids: Vec<AgentId>,
    pub resolution: String,
    pub consensus_points: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsolidationResult {
    pub content: String,
    pub conflict: ConflictInfo,
    /// Never true while `conflict.detected` is true.
    pub consensus: bool,
    pub source_count: usize,
    pub success_count: usize,
}

#[derive(Deserialize)]
struct ConflictReply {
    #[serde(default)]
    has_conflict: bool,
    #[serde(default)]
    conflict_description: String,
    #[serde(default)]
    conflicting_sources: Vec<i64>,
    #[serde(default)]
    resolution_suggestion: String,
    #[serde(default)]
    consensus_points: Vec<String>,
}

/// Merges the answers of one or more agents into a single reply.
pub struct ResultConsolidator {
    model: Arc<dyn ChatModel>,
    options: ChatOptions,
}

impl ResultConsolidator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            options: ChatOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Single results pass through untouched, including their error. Several
    /// results are merged by the model, or by plain concatenation when the
    /// model call fails.
    #[instrument(skip_all, fields(workflow = %execution.workflow, results = execution.results.len()))]
    pub async fn consolidate(
        &self,
        execution: &ExecutionResult,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        if execution.workflow == WorkflowKind::Single || execution.results.len() == 1 {
            let first = execution.results.first().ok_or(EngineError::NoResults)?;
            return match &first.error {
                Some(e) => Err(EngineError::Gateway(e.clone())),
                None => Ok(first.content.clone()),
            };
        }
        if execution.results.is_empty() {
            return Err(EngineError::NoResults);
        }

        let messages = render_pair(
            CONSOLIDATION_SYSTEM_PROMPT,
            CONSOLIDATION_USER_PROMPT,
            query,
            &format_results(execution),
        );
        match complete_with_cancel(self.model.as_ref(), &messages, &self.options, cancel).await {
            Ok(merged) => {
                debug!(len = merged.len(), "results consolidated by model");
                Ok(merged)
            }
            Err(e) => {
                warn!(error = %e, "model consolidation failed, using simple merge");
                Ok(self.consolidate_simple(execution))
            }
        }
    }

    /// Concatenate every successful non-empty answer. No model call.
    pub fn consolidate_simple(&self, execution: &ExecutionResult) -> String {
        let parts: Vec<&str> = execution
            .results
            .iter()
            .filter(|r| r.is_success() && !r.content.is_empty())
            .map(|r| r.content.as_str())
            .collect();
        if parts.is_empty() {
            return NO_RESULT_APOLOGY.to_string();
        }
        parts.join(MERGE_DIVIDER)
    }

    /// Like `consolidate`, but first asks the model whether the successful
    /// answers contradict each other. Detection failures count as "no conflict".
    pub async fn consolidate_with_conflict_detection(
        &self,
        execution: &ExecutionResult,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<ConsolidationResult, EngineError> {
        let source_count = execution.results.len();
        let success_count = execution.success_count();

        if source_count <= 1 || success_count <= 1 {
            let content = execution
                .results
                .iter()
                .find(|r| r.is_success())
                .map(|r| r.content.clone())
                .unwrap_or_default();
            return Ok(ConsolidationResult {
                content,
                conflict: ConflictInfo::default(),
                consensus: true,
                source_count,
                success_count,
            });
        }

        let conflict = match self.detect_conflicts(execution, query, cancel).await {
            Ok(conflict) => conflict,
            Err(e) => {
                warn!(error = %e, "conflict detection failed, assuming none");
                ConflictInfo::default()
            }
        };
        if conflict.detected {
            info!(agents = ?conflict.agent_ids, description = %conflict.description, "conflicting answers");
        }

        let content = self.consolidate(execution, query, cancel).await?;
        Ok(ConsolidationResult {
            content,
            consensus: !conflict.detected,
            conflict,
            source_count,
            success_count,
        })
    }

    async fn detect_conflicts(
        &self,
        execution: &ExecutionResult,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<ConflictInfo, EngineError> {
        let messages = render_pair(
            CONFLICT_DETECTION_SYSTEM_PROMPT,
            CONFLICT_DETECTION_USER_PROMPT,
            query,
            &format_results(execution),
        );
        let raw = complete_with_cancel(self.model.as_ref(), &messages, &self.options, cancel).await?;
        Ok(parse_conflict_reply(&raw, execution))
    }
}

fn render_pair(system: &str, user: &str, query: &str, results: &str) -> [ConversationTurn; 2] {
    let user = user
        .replace("{original_query}", query)
        .replace("{results_content}", results);
    [ConversationTurn::system(system), ConversationTurn::user(user)]
}

/// Labeled block of every result, numbered from 1 in execution order.
pub fn format_results(execution: &ExecutionResult) -> String {
    let mut out = String::new();
    for (i, result) in execution.results.iter().enumerate() {
        let n = i + 1;
        match &result.error {
            Some(e) => {
                let _ = write!(out, "### Result {n} (failed)\nError: {e}\n\n");
            }
            None => {
                let sub = result
                    .sub_question
                    .as_ref()
                    .map(|sq| format!("\nSub-question: {}", sq.question))
                    .unwrap_or_default();
                let _ = write!(out, "### Result {n}{sub}\n{}\n\n", result.content);
            }
        }
    }
    out
}

fn parse_conflict_reply(raw: &str, execution: &ExecutionResult) -> ConflictInfo {
    let reply: ConflictReply = match decode_object(raw) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "conflict reply not decodable, assuming none");
            return ConflictInfo::default();
        }
    };
    let agent_ids = reply
        .conflicting_sources
        .iter()
        .filter_map(|&idx| usize::try_from(idx).ok())
        .filter(|&idx| idx >= 1)
        .filter_map(|idx| execution.results.get(idx - 1))
        .map(|r| r.agent_id.clone())
        .collect();
    ConflictInfo {
        detected: reply.has_conflict,
        description: reply.conflict_description,
        agent_ids,
        resolution: reply.resolution_suggestion,
        consensus_points: reply.consensus_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::errors::GatewayError;
    use conductor_llm::mock::{MockChatModel, MockReply};
    use std::time::Duration;

    use crate::execution::AgentResult;
    use crate::routing::SubQuestion;

    fn id(s: &str) -> AgentId {
        AgentId::from_raw(s)
    }

    fn three_with_b_timed_out() -> ExecutionResult {
        ExecutionResult::new(
            vec![
                AgentResult::ok(id("a"), "Plan A costs $10."),
                AgentResult::failed(id("b"), GatewayError::Timeout(Duration::from_secs(30))),
                AgentResult::ok(id("c"), "Shipping takes 3 days."),
            ],
            WorkflowKind::Parallel,
        )
    }

    fn consolidator(model: &Arc<MockChatModel>) -> ResultConsolidator {
        ResultConsolidator::new(model.clone())
    }

    #[tokio::test]
    async fn single_result_passes_through_without_model() {
        let model = Arc::new(MockChatModel::with_texts(Vec::<String>::new()));
        let execution = ExecutionResult::new(
            vec![AgentResult::ok(id("a"), "  exact *content*\n")],
            WorkflowKind::Parallel,
        );
        let out = consolidator(&model)
            .consolidate(&execution, "q", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "  exact *content*\n");
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn single_failed_result_returns_its_error() {
        let model = Arc::new(MockChatModel::with_texts(Vec::<String>::new()));
        let execution = ExecutionResult::new(
            vec![AgentResult::failed(id("a"), GatewayError::Agent("tool crashed".into()))],
            WorkflowKind::Single,
        );
        let err = consolidator(&model)
            .consolidate(&execution, "q", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Gateway(GatewayError::Agent(_))));
    }

    #[tokio::test]
    async fn no_results_is_an_error() {
        let model = Arc::new(MockChatModel::with_texts(Vec::<String>::new()));
        let execution = ExecutionResult::new(Vec::new(), WorkflowKind::Single);
        let err = consolidator(&model)
            .consolidate(&execution, "q", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoResults));
    }

    #[tokio::test]
    async fn several_results_are_merged_by_model() {
        let model = Arc::new(MockChatModel::with_texts(["Plan A is $10 and ships in 3 days."]));
        let out = consolidator(&model)
            .consolidate(&three_with_b_timed_out(), "price and shipping?", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "Plan A is $10 and ships in 3 days.");

        let prompts = model.prompts();
        assert!(prompts[0][0].is_system());
        let user = &prompts[0][1].content;
        assert!(user.contains("price and shipping?"));
        assert!(user.contains("### Result 2 (failed)\nError: timeout"));
    }

    #[tokio::test]
    async fn model_failure_degrades_to_simple_merge_of_successes() {
        let model = Arc::new(MockChatModel::new(vec![MockReply::Error(GatewayError::ProviderOverloaded)]));
        let out = consolidator(&model)
            .consolidate(&three_with_b_timed_out(), "q", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "Plan A costs $10.\n\n---\n\nShipping takes 3 days.");
    }

    #[test]
    fn simple_merge_with_no_successes_apologizes() {
        let model = Arc::new(MockChatModel::with_texts(Vec::<String>::new()));
        let execution = ExecutionResult::new(
            vec![
                AgentResult::failed(id("a"), GatewayError::Cancelled),
                AgentResult::ok(id("b"), ""),
            ],
            WorkflowKind::Parallel,
        );
        assert_eq!(consolidator(&model).consolidate_simple(&execution), NO_RESULT_APOLOGY);
    }

    #[test]
    fn format_labels_sub_questions_and_failures() {
        let sq = SubQuestion {
            id: "sq-1".into(),
            question: "How much is plan A?".into(),
            intent: "pricing".into(),
            assigned_agent_id: id("a"),
        };
        let execution = ExecutionResult::new(
            vec![
                AgentResult::ok(id("a"), "$10").with_sub_question(Some(sq)),
                AgentResult::failed(id("b"), GatewayError::Cancelled),
            ],
            WorkflowKind::Parallel,
        );
        assert_eq!(
            format_results(&execution),
            "### Result 1\nSub-question: How much is plan A?\n$10\n\n### Result 2 (failed)\nError: cancelled\n\n"
        );
    }

    #[tokio::test]
    async fn conflict_detection_skipped_with_one_success() {
        let model = Arc::new(MockChatModel::with_texts(Vec::<String>::new()));
        let execution = ExecutionResult::new(
            vec![
                AgentResult::failed(id("a"), GatewayError::Cancelled),
                AgentResult::ok(id("b"), "only answer"),
                AgentResult::failed(id("c"), GatewayError::ProviderOverloaded),
            ],
            WorkflowKind::Parallel,
        );
        let result = consolidator(&model)
            .consolidate_with_conflict_detection(&execution, "q", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.consensus);
        assert!(!result.conflict.detected);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.source_count, 3);
        assert_eq!(result.content, "only answer");
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn partial_failure_reports_two_successes() {
        let model = Arc::new(MockChatModel::with_texts([
            "```json\n{\"has_conflict\": false, \"consensus_points\": [\"plan A exists\"]}\n```",
            "merged answer",
        ]));
        let result = consolidator(&model)
            .consolidate_with_conflict_detection(&three_with_b_timed_out(), "q", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert_eq!(result.source_count, 3);
        assert!(result.consensus);
        assert_eq!(result.conflict.consensus_points, vec!["plan A exists".to_string()]);
        assert_eq!(result.content, "merged answer");
    }

    #[tokio::test]
    async fn conflicting_sources_map_to_agent_ids() {
        let model = Arc::new(MockChatModel::with_texts([
            r#"{"has_conflict": true, "conflict_description": "prices differ",
                "conflicting_sources": [1, 3, 9, 0, -2], "resolution_suggestion": "check the price list"}"#,
            "merged",
        ]));
        let result = consolidator(&model)
            .consolidate_with_conflict_detection(&three_with_b_timed_out(), "q", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.conflict.detected);
        assert!(!result.consensus);
        assert_eq!(result.conflict.agent_ids, vec![id("a"), id("c")]);
        assert_eq!(result.conflict.resolution, "check the price list");
    }

    #[tokio::test]
    async fn unreadable_conflict_reply_means_no_conflict() {
        let model = Arc::new(MockChatModel::with_texts(["they look consistent to me", "merged"]));
        let result = consolidator(&model)
            .consolidate_with_conflict_detection(&three_with_b_timed_out(), "q", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.conflict.detected);
        assert!(result.consensus);
        assert_eq!(result.content, "merged");
    }

    #[tokio::test]
    async fn detection_transport_error_means_no_conflict() {
        let model = Arc::new(MockChatModel::new(vec![
            MockReply::Error(GatewayError::NetworkError("reset".into())),
            MockReply::text("merged"),
        ]));
        let result = consolidator(&model)
            .consolidate_with_conflict_detection(&three_with_b_timed_out(), "q", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.consensus);
        assert_eq!(result.content, "merged");
    }
}
