use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conductor_core::chat::{complete_with_cancel, ChatModel, ChatOptions};
use conductor_core::ids::AgentId;
use conductor_core::turns::ConversationTurn;

use crate::error::EngineError;
use crate::extract::decode_object;

use super::intent::{IntentMatch, IntentRouter, INTENT_ESCALATE, INTENT_GREETING, INTENT_ORDER};
use super::prompts::render_analyzer_prompt;
use super::types::{AnalysisContext, QueryAnalysisResult, WorkflowKind};

#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    /// Confidence reported for keyword fast-path decisions.
    pub quick_confidence: f64,
    /// Confidence reported for fallback decisions, and the value that
    /// replaces out-of-range model confidences.
    pub fallback_confidence: f64,
    pub chat_options: ChatOptions,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            quick_confidence: 0.95,
            fallback_confidence: 0.5,
            chat_options: ChatOptions::default(),
        }
    }
}

/// Decides the workflow and agent selection for a query: keyword fast-path
/// first, one model call otherwise, deterministic fallback when the model's
/// answer is unusable.
pub struct QueryAnalyzer {
    model: Arc<dyn ChatModel>,
    router: Arc<IntentRouter>,
    config: AnalyzerConfig,
}

impl QueryAnalyzer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            router: Arc::new(IntentRouter::new()),
            config: AnalyzerConfig::default(),
        }
    }

    pub fn with_router(mut self, router: Arc<IntentRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn with_config(mut self, config: AnalyzerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(&self) -> &Arc<IntentRouter> {
        &self.router
    }

    /// Analyze a query.
    ///
    /// Malformed or invalid model output never errors; it yields the fallback
    /// decision. Only a failure to reach the model at all is returned.
    #[instrument(skip(self, ctx, cancel), fields(tenant = %ctx.tenant_id, agents = ctx.available_agents.len()))]
    pub async fn analyze(
        &self,
        ctx: &AnalysisContext,
        cancel: &CancellationToken,
    ) -> Result<QueryAnalysisResult, EngineError> {
        let quick = self.router.classify(&ctx.query);
        if quick.matched && quick.skip_analysis {
            info!(intent = %quick.intent, reason = %quick.reason, "fast-path decision");
            return Ok(self.quick_result(&quick, ctx));
        }

        let hint = quick.matched.then_some(quick.intent.as_str());
        if let Some(intent) = hint {
            debug!(intent, "partial intent match, continuing with model analysis");
        }

        let prompt = render_analyzer_prompt(&ctx.available_agents, &ctx.query, hint);
        let messages = [ConversationTurn::user(prompt)];
        let raw = complete_with_cancel(
            self.model.as_ref(),
            &messages,
            &self.config.chat_options,
            cancel,
        )
        .await?;
        debug!(response_len = raw.len(), "analysis response received");

        let mut result = match decode_object::<QueryAnalysisResult>(&raw) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "analysis output not decodable, using fallback");
                return Ok(self.fallback(ctx, hint));
            }
        };

        if let Err(reason) = self.validate(&mut result, ctx) {
            warn!(%reason, "analysis output rejected, using fallback");
            return Ok(self.fallback(ctx, hint));
        }

        info!(
            workflow = %result.workflow,
            agents = ?result.selected_agent_ids,
            complex = result.is_complex,
            "query analyzed"
        );
        Ok(result)
    }

    /// Convenience wrapper when no session context is at hand.
    pub async fn analyze_simple(
        &self,
        query: &str,
        agents: Vec<conductor_core::agent::AgentProfile>,
    ) -> Result<QueryAnalysisResult, EngineError> {
        let ctx = AnalysisContext::new(Default::default(), query, agents);
        self.analyze(&ctx, &CancellationToken::new()).await
    }

    /// Single-agent decision used whenever the model can't be trusted or reached.
    /// A matched intent steers which agent is picked.
    pub fn fallback(&self, ctx: &AnalysisContext, intent: Option<&str>) -> QueryAnalysisResult {
        let agent = match intent {
            Some(INTENT_ORDER) => order_agent(ctx).or_else(|| ctx.first_agent()),
            _ => ctx.first_agent(),
        };
        QueryAnalysisResult {
            selected_agent_ids: agent.cloned().into_iter().collect(),
            selection_reasoning: "fallback: analysis unavailable, using default agent".into(),
            workflow: WorkflowKind::Single,
            workflow_reasoning: "fallback: default single-agent workflow".into(),
            confidence_score: self.config.fallback_confidence,
            is_complex: false,
            sub_questions: Vec::new(),
        }
    }

    fn quick_result(&self, quick: &IntentMatch, ctx: &AnalysisContext) -> QueryAnalysisResult {
        let (selected, selection_reasoning, workflow_reasoning) = match quick.intent.as_str() {
            INTENT_ESCALATE => (
                None,
                "user asked for a human agent".to_string(),
                "keyword fast-path: escalate to human",
            ),
            INTENT_GREETING => (
                ctx.first_agent(),
                "simple greeting, default agent".to_string(),
                "keyword fast-path: greeting",
            ),
            INTENT_ORDER => (
                order_agent(ctx).or_else(|| ctx.first_agent()),
                "order keywords detected".to_string(),
                "keyword fast-path: order inquiry",
            ),
            _ => (
                ctx.first_agent(),
                quick.reason.clone(),
                "keyword fast-path",
            ),
        };
        QueryAnalysisResult {
            selected_agent_ids: selected.cloned().into_iter().collect(),
            selection_reasoning,
            workflow: WorkflowKind::Single,
            workflow_reasoning: workflow_reasoning.to_string(),
            confidence_score: self.config.quick_confidence,
            is_complex: false,
            sub_questions: Vec::new(),
        }
    }

    fn validate(&self, result: &mut QueryAnalysisResult, ctx: &AnalysisContext) -> Result<(), String> {
        if result.selected_agent_ids.is_empty() {
            return Err("no agents selected".into());
        }
        let available: HashSet<&AgentId> = ctx.available_agents.iter().map(|a| &a.id).collect();
        if let Some(unknown) = result.selected_agent_ids.iter().find(|id| !available.contains(id)) {
            return Err(format!("selected agent {unknown} is not available"));
        }
        if !result.workflow.is_selectable() {
            return Err(format!("workflow {} cannot be selected", result.workflow));
        }
        if !(0.0..=1.0).contains(&result.confidence_score) {
            result.confidence_score = self.config.fallback_confidence;
        }

        let selected: HashSet<&AgentId> = result.selected_agent_ids.iter().collect();
        let before = result.sub_questions.len();
        result
            .sub_questions
            .retain(|sq| selected.contains(&sq.assigned_agent_id));
        if result.sub_questions.len() != before {
            warn!(
                dropped = before - result.sub_questions.len(),
                "dropped sub-questions assigned to unselected agents"
            );
        }
        Ok(())
    }
}

fn order_agent(ctx: &AnalysisContext) -> Option<&AgentId> {
    ctx.available_agents
        .iter()
        .find(|agent| {
            let name = agent.name.to_lowercase();
            let description = agent.description.to_lowercase();
            ["order", "订单"]
                .iter()
                .any(|kw| name.contains(kw) || description.contains(kw))
        })
        .map(|agent| &agent.id)
}
