//! Orchestration driver: one inbound message in, one reply out.
//!
//! `SessionOrchestrator` is what the HTTP surface talks to. `Orchestrator`
//! wires the analyzer, dispatcher, consolidator and memory together and
//! relays live progress through a per-request stream session.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use conductor_core::agent::{AgentDefinition, EventSink};
use conductor_core::events::StreamEvent;
use conductor_core::ids::{AgentId, RequestId, RunId, SessionId, StreamId, TenantId};
use conductor_core::turns::SessionKey;
use conductor_engine::{
    AnalysisContext, ConsolidationResult, DispatchInput, Dispatcher, EngineError, MemoryManager,
    QueryAnalyzer, ResultConsolidator, WorkflowKind, NO_RESULT_APOLOGY,
};

use crate::stream::{StreamManager, StreamSession};

pub const ESCALATION_MESSAGE: &str =
    "I'm transferring you to a human agent now. Please hold on, someone will be with you shortly.";
pub const RUN_FAILURE_APOLOGY: &str =
    "Sorry, something went wrong while handling your request. Please try again in a moment.";
pub const RUN_CANCELLED_MESSAGE: &str = "The request was cancelled.";

const HUMAN_HANDOFF: &str = "human";
const ORCHESTRATOR_NAME: &str = "orchestrator";

/// One inbound user message plus the agents allowed to answer it.
#[derive(Clone, Debug, Deserialize)]
pub struct RunRequest {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    #[serde(default)]
    pub user_id: Option<String>,
    pub message: String,
    pub agents: Vec<AgentDefinition>,
    /// Caller-chosen id for stream lookup. Generated when absent.
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Escalated,
    Failed,
    Cancelled,
}

/// What the caller gets back. `content` is always a user-presentable reply.
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub request_id: RequestId,
    pub stream_id: StreamId,
    pub status: RunStatus,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowKind>,
    pub agent_ids: Vec<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<ConsolidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait SessionOrchestrator: Send + Sync {
    /// Handle one message end to end. Only refuses when the request id is
    /// already running; every other failure is folded into the outcome.
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, EngineError>;
    fn cancel(&self, request_id: &RequestId) -> bool;
    fn active_runs(&self) -> usize;
    fn streams(&self) -> &Arc<StreamManager>;
}

struct ActiveRun {
    cancel: CancellationToken,
    _started_at: Instant,
}

/// Removes the active-run entry when the run ends. If the caller drops the
/// run future mid-flight, the stream session is cancelled as well.
struct RunRegistration<'a> {
    runs: &'a DashMap<RequestId, ActiveRun>,
    request_id: RequestId,
    session: Arc<StreamSession>,
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        if self.session.cancel() {
            warn!(request_id = %self.request_id, "run abandoned before finishing");
        }
        self.runs.remove(&self.request_id);
    }
}

/// Successful pipeline result before it is turned into an outcome.
struct Reply {
    status: RunStatus,
    content: String,
    workflow: Option<WorkflowKind>,
    agent_ids: Vec<AgentId>,
    consolidation: Option<ConsolidationResult>,
}

pub struct Orchestrator {
    analyzer: QueryAnalyzer,
    dispatcher: Dispatcher,
    consolidator: ResultConsolidator,
    memory: MemoryManager,
    streams: Arc<StreamManager>,
    active_runs: DashMap<RequestId, ActiveRun>,
}

impl Orchestrator {
    pub fn new(
        analyzer: QueryAnalyzer,
        dispatcher: Dispatcher,
        consolidator: ResultConsolidator,
        memory: MemoryManager,
        streams: Arc<StreamManager>,
    ) -> Self {
        Self {
            analyzer,
            dispatcher,
            consolidator,
            memory,
            streams,
            active_runs: DashMap::new(),
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    async fn execute(
        &self,
        request: &RunRequest,
        key: &SessionKey,
        session: &Arc<StreamSession>,
        cancel: &CancellationToken,
    ) -> Result<Reply, EngineError> {
        if request.agents.is_empty() {
            return Err(EngineError::NoAgents);
        }

        // Context first: the stored history must not already contain this message.
        let context = self
            .memory
            .build_context_messages(key, request.system_prompt.as_deref(), &request.message)
            .await?;
        self.memory.add_user_turn(key, &request.message).await?;

        let mut actx = AnalysisContext::new(
            request.tenant_id.clone(),
            request.message.clone(),
            request.agents.iter().map(|a| a.profile.clone()).collect(),
        )
        .with_session(request.session_id.clone());
        actx.user_id = request.user_id.clone();

        let plan = match self.analyzer.analyze(&actx, cancel).await {
            Ok(plan) => plan,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!(stage = "analyze", error = %e, "analysis unavailable, using fallback");
                self.analyzer.fallback(&actx, None)
            }
        };

        if plan.is_escalation() {
            info!(reason = %plan.selection_reasoning, "escalating to a human");
            session.emit(StreamEvent::transfer(ORCHESTRATOR_NAME, HUMAN_HANDOFF));
            self.memory.add_assistant_turn(key, ESCALATION_MESSAGE).await?;
            return Ok(Reply {
                status: RunStatus::Escalated,
                content: ESCALATION_MESSAGE.to_string(),
                workflow: None,
                agent_ids: Vec::new(),
                consolidation: None,
            });
        }

        let sink: Arc<dyn EventSink> = session.clone();
        let execution = self
            .dispatcher
            .run(
                DispatchInput {
                    plan: &plan,
                    agents: &request.agents,
                    context: &context,
                    query: &request.message,
                },
                cancel,
                sink,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }

        let (content, consolidation) = if let Some(answer) = execution.final_answer.clone() {
            (answer, None)
        } else if execution.results.len() > 1 {
            let merged = self
                .consolidator
                .consolidate_with_conflict_detection(&execution, &request.message, cancel)
                .await?;
            if merged.conflict.detected {
                info!(description = %merged.conflict.description, "agents disagreed");
            }
            (merged.content.clone(), Some(merged))
        } else {
            let reply = self
                .consolidator
                .consolidate(&execution, &request.message, cancel)
                .await?;
            (reply, None)
        };
        let content = if content.trim().is_empty() {
            NO_RESULT_APOLOGY.to_string()
        } else {
            content
        };

        self.memory.add_assistant_turn(key, &content).await?;
        if let Err(e) = self.memory.summarize_if_needed(key, cancel).await {
            warn!(stage = "summarize", error = %e, "history summarization failed");
        }

        Ok(Reply {
            status: RunStatus::Completed,
            content,
            workflow: Some(execution.workflow),
            agent_ids: execution.agent_ids(),
            consolidation,
        })
    }
}

#[async_trait]
impl SessionOrchestrator for Orchestrator {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, EngineError> {
        let request_id = request.request_id.clone().unwrap_or_default();
        let cancel = CancellationToken::new();
        match self.active_runs.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::Internal(format!(
                    "request {request_id} is already running"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    cancel: cancel.clone(),
                    _started_at: Instant::now(),
                });
            }
        }
        let run_id = RunId::from_raw(format!("run-{}", uuid::Uuid::now_v7()));
        let session = self
            .streams
            .create_session(request_id.clone(), request.tenant_id.clone());
        let registration = RunRegistration {
            runs: &self.active_runs,
            request_id: request_id.clone(),
            session: Arc::clone(&session),
        };
        let key = SessionKey::new(request.tenant_id.clone(), request.session_id.clone());

        let span = info_span!(
            "run",
            run_id = %run_id,
            request_id = %request_id,
            stream_id = %session.id(),
            session = %key,
        );
        let result = self
            .execute(&request, &key, &session, &cancel)
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        let outcome = match result {
            Ok(reply) => {
                session.emit(StreamEvent::complete(Some(reply.content.clone())));
                session.complete();
                info!(status = ?reply.status, agents = reply.agent_ids.len(), "run finished");
                RunOutcome {
                    run_id,
                    request_id,
                    stream_id: session.id().clone(),
                    status: reply.status,
                    content: reply.content,
                    workflow: reply.workflow,
                    agent_ids: reply.agent_ids,
                    consolidation: reply.consolidation,
                    error: None,
                }
            }
            Err(e) if cancel.is_cancelled() || e.is_cancellation() => {
                info!("run cancelled");
                session.cancel();
                failed_outcome(run_id, request_id, &session, RunStatus::Cancelled, RUN_CANCELLED_MESSAGE, &e)
            }
            Err(e) => {
                error!(error = %e, "run failed");
                session.emit(StreamEvent::error(None, e.to_string()));
                session.set_error(e.to_string());
                failed_outcome(run_id, request_id, &session, RunStatus::Failed, failure_reply(&e), &e)
            }
        };
        drop(registration);
        Ok(outcome)
    }

    fn cancel(&self, request_id: &RequestId) -> bool {
        let run = self
            .active_runs
            .get(request_id)
            .map(|run| run.cancel.clone());
        let stream = self.streams.get_session_by_request(request_id);
        if let Some(token) = &run {
            token.cancel();
        }
        let stream_closed = stream.is_some_and(|s| s.cancel());
        let found = run.is_some() || stream_closed;
        if found {
            info!(request_id = %request_id, "run cancellation requested");
        }
        found
    }

    fn active_runs(&self) -> usize {
        self.active_runs.len()
    }

    fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }
}

/// Agent and model failures mean the answer could not be fetched; anything
/// else is an internal fault.
fn failure_reply(err: &EngineError) -> &'static str {
    match err {
        EngineError::Gateway(_) | EngineError::NoResults => NO_RESULT_APOLOGY,
        _ => RUN_FAILURE_APOLOGY,
    }
}

fn failed_outcome(
    run_id: RunId,
    request_id: RequestId,
    session: &StreamSession,
    status: RunStatus,
    content: &str,
    err: &EngineError,
) -> RunOutcome {
    RunOutcome {
        run_id,
        request_id,
        stream_id: session.id().clone(),
        status,
        content: content.to_string(),
        workflow: None,
        agent_ids: Vec::new(),
        consolidation: None,
        error: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use conductor_core::agent::AgentProfile;
    use conductor_core::errors::GatewayError;
    use conductor_core::events::EventType;
    use conductor_core::turns::Role;
    use conductor_engine::{DispatchConfig, MemoryConfig, Summarizer, SummarizerConfig};
    use conductor_llm::mock::{AgentScript, MockAgent, MockChatModel, MockReply};
    use conductor_store::EphemeralStore;

    use crate::stream::{SessionState, StreamConfig};

    fn agent(id: &str, name: &str, desc: &str) -> AgentDefinition {
        AgentDefinition::new(AgentProfile::new(id, name, desc), format!("You are {name}."))
    }

    fn agents() -> Vec<AgentDefinition> {
        vec![
            agent("billing", "Billing", "invoices and payments"),
            agent("orders", "Order desk", "order status"),
            agent("shipping", "Shipping", "parcel tracking"),
        ]
    }

    fn request(message: &str, request_id: &str) -> RunRequest {
        RunRequest {
            tenant_id: TenantId::from_raw("acme"),
            session_id: SessionId::from_raw("s1"),
            user_id: None,
            message: message.into(),
            agents: agents(),
            request_id: Some(RequestId::from_raw(request_id)),
            system_prompt: None,
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        analyzer_model: Arc<MockChatModel>,
        consolidator_model: Arc<MockChatModel>,
        executor: Arc<MockAgent>,
    }

    fn harness(
        analyzer: Vec<MockReply>,
        consolidator: Vec<MockReply>,
        executor: MockAgent,
    ) -> Harness {
        let analyzer_model = Arc::new(MockChatModel::new(analyzer));
        let consolidator_model = Arc::new(MockChatModel::new(consolidator));
        let executor = Arc::new(executor);
        let streams = Arc::new(StreamManager::new(StreamConfig::default()));
        let memory = MemoryManager::new(Arc::new(EphemeralStore::new()), MemoryConfig::default());
        let orchestrator = Orchestrator::new(
            QueryAnalyzer::new(analyzer_model.clone()),
            Dispatcher::new(
                executor.clone(),
                Arc::new(MockChatModel::new(vec![])),
                DispatchConfig {
                    agent_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
            ),
            ResultConsolidator::new(consolidator_model.clone()),
            memory,
            streams,
        );
        Harness {
            orchestrator,
            analyzer_model,
            consolidator_model,
            executor,
        }
    }

    fn plan(workflow: &str, agents: &[&str]) -> MockReply {
        MockReply::Text(
            serde_json::json!({
                "selected_agent_ids": agents,
                "selection_reasoning": "test plan",
                "workflow": workflow,
                "confidence_score": 0.9,
            })
            .to_string(),
        )
    }

    fn key() -> SessionKey {
        SessionKey::new(TenantId::from_raw("acme"), SessionId::from_raw("s1"))
    }

    #[tokio::test]
    async fn single_agent_run_persists_and_completes_stream() {
        let h = harness(
            vec![plan("single", &["billing"])],
            vec![],
            MockAgent::new().with(
                "billing",
                AgentScript::reply("Your invoice is paid.")
                    .with_events(vec![StreamEvent::tool_call("Billing", "lookup_invoice", serde_json::json!({}))]),
            ),
        );

        let outcome = h.orchestrator.run(request("is my invoice paid?", "req_1")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.content, "Your invoice is paid.");
        assert_eq!(outcome.workflow, Some(WorkflowKind::Single));
        assert!(outcome.run_id.as_str().starts_with("run-"));
        assert_eq!(h.consolidator_model.call_count(), 0);

        let history = h.orchestrator.memory().history(&key()).await.unwrap();
        let shape: Vec<_> = history.iter().map(|t| (t.role, t.content.as_str())).collect();
        assert_eq!(
            shape,
            [(Role::User, "is my invoice paid?"), (Role::Assistant, "Your invoice is paid.")]
        );

        let session = h
            .orchestrator
            .streams()
            .get_session_by_request(&RequestId::from_raw("req_1"))
            .unwrap();
        assert_eq!(session.state(), SessionState::Complete);
        let types: Vec<_> = session.buffered_events().iter().map(|e| e.event_type).collect();
        assert_eq!(types, [EventType::ToolCall, EventType::Complete]);
        assert_eq!(h.orchestrator.active_runs(), 0);
    }

    #[tokio::test]
    async fn dispatched_agent_sees_history_without_duplicate_user_turn() {
        let h = harness(
            vec![plan("single", &["billing"]), plan("single", &["billing"])],
            vec![],
            MockAgent::new().with("billing", AgentScript::reply("ok")),
        );
        h.orchestrator.run(request("first question", "req_1")).await.unwrap();
        h.orchestrator.run(request("second question", "req_2")).await.unwrap();

        let requests = h.executor.requests();
        let last = &requests[1].messages;
        let contents: Vec<_> = last.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, ["first question", "ok", "second question"]);
    }

    #[tokio::test]
    async fn greeting_takes_fast_path_without_analysis() {
        let h = harness(
            vec![],
            vec![],
            MockAgent::new().with("billing", AgentScript::reply("Hello! How can I help?")),
        );
        let outcome = h.orchestrator.run(request("hello", "req_1")).await.unwrap();
        assert_eq!(outcome.content, "Hello! How can I help?");
        assert_eq!(outcome.agent_ids, [AgentId::from_raw("billing")]);
        assert_eq!(h.analyzer_model.call_count(), 0);
    }

    #[tokio::test]
    async fn escalation_hands_off_without_dispatch() {
        let h = harness(vec![], vec![], MockAgent::new());
        let outcome = h.orchestrator.run(request("转人工", "req_1")).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Escalated);
        assert_eq!(outcome.content, ESCALATION_MESSAGE);
        assert!(h.executor.executed_agents().is_empty());

        let session = h
            .orchestrator
            .streams()
            .get_session_by_request(&RequestId::from_raw("req_1"))
            .unwrap();
        let types: Vec<_> = session.buffered_events().iter().map(|e| e.event_type).collect();
        assert_eq!(types, [EventType::Transfer, EventType::Complete]);

        let history = h.orchestrator.memory().history(&key()).await.unwrap();
        assert_eq!(history.last().unwrap().content, ESCALATION_MESSAGE);
    }

    #[tokio::test]
    async fn parallel_run_consolidates_with_conflict_detection() {
        let h = harness(
            vec![plan("parallel", &["billing", "shipping"])],
            vec![
                MockReply::Text(r#"{"has_conflict": false}"#.into()),
                MockReply::Text("Paid, and the parcel ships tomorrow.".into()),
            ],
            MockAgent::new()
                .with("billing", AgentScript::reply("Paid."))
                .with("shipping", AgentScript::reply("Ships tomorrow.")),
        );
        let outcome = h
            .orchestrator
            .run(request("is it paid and when will the parcel arrive?", "req_1"))
            .await
            .unwrap();

        assert_eq!(outcome.content, "Paid, and the parcel ships tomorrow.");
        let consolidation = outcome.consolidation.unwrap();
        assert!(consolidation.consensus);
        assert_eq!(consolidation.success_count, 2);
        assert_eq!(h.consolidator_model.call_count(), 2);
    }

    #[tokio::test]
    async fn analyzer_outage_falls_back_to_first_agent() {
        let h = harness(
            vec![MockReply::Error(GatewayError::Timeout(Duration::from_secs(1)))],
            vec![],
            MockAgent::new().with("billing", AgentScript::reply("fallback answer")),
        );
        let outcome = h.orchestrator.run(request("my account looks odd", "req_1")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.content, "fallback answer");
        assert_eq!(h.executor.executed_agents(), [AgentId::from_raw("billing")]);
    }

    #[tokio::test]
    async fn agent_failure_becomes_apology_and_error_event() {
        let h = harness(
            vec![plan("single", &["billing"])],
            vec![],
            MockAgent::new().with(
                "billing",
                AgentScript::fail(GatewayError::Agent("model refused".into())),
            ),
        );
        let outcome = h.orchestrator.run(request("refund me", "req_1")).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.content, NO_RESULT_APOLOGY);
        assert!(outcome.error.is_some());

        let session = h
            .orchestrator
            .streams()
            .get_session_by_request(&RequestId::from_raw("req_1"))
            .unwrap();
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(
            session.buffered_events().last().map(|e| e.event_type),
            Some(EventType::Error)
        );
    }

    #[tokio::test]
    async fn empty_agent_list_fails_gracefully() {
        let h = harness(vec![], vec![], MockAgent::new());
        let mut req = request("help", "req_1");
        req.agents.clear();
        let outcome = h.orchestrator.run(req).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.content, RUN_FAILURE_APOLOGY);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_a_running_request() {
        let h = Arc::new(harness(
            vec![plan("single", &["billing"])],
            vec![],
            MockAgent::new().with(
                "billing",
                AgentScript::reply("too late").delayed(Duration::from_secs(3)),
            ),
        ));

        let runner = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.orchestrator.run(request("slow one", "req_1")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.orchestrator.active_runs(), 1);
        assert!(h.orchestrator.cancel(&RequestId::from_raw("req_1")));

        let outcome = runner.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.content, RUN_CANCELLED_MESSAGE);
        assert!(!h.orchestrator.cancel(&RequestId::from_raw("req_missing")));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_request_id_is_rejected_while_running() {
        let h = Arc::new(harness(
            vec![plan("single", &["billing"])],
            vec![],
            MockAgent::new().with(
                "billing",
                AgentScript::reply("done").delayed(Duration::from_secs(1)),
            ),
        ));
        let first = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.orchestrator.run(request("q", "req_1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = h.orchestrator.run(request("q", "req_1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
        assert_eq!(first.await.unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_with_same_request_id_register_once() {
        let h = harness(
            vec![plan("single", &["billing"]), plan("single", &["billing"])],
            vec![],
            MockAgent::new().with(
                "billing",
                AgentScript::reply("done").delayed(Duration::from_secs(2)),
            ),
        );

        let cancel_after_start = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(h.orchestrator.active_runs(), 1);
            h.orchestrator.cancel(&RequestId::from_raw("req_1"))
        };
        let (a, b, cancelled) = tokio::join!(
            h.orchestrator.run(request("first", "req_1")),
            h.orchestrator.run(request("second", "req_1")),
            cancel_after_start,
        );

        assert!(cancelled);
        let (winner, loser) = match (a, b) {
            (Ok(outcome), Err(e)) | (Err(e), Ok(outcome)) => (outcome, e),
            other => panic!("expected exactly one registered run, got {other:?}"),
        };
        assert!(matches!(loser, EngineError::Internal(_)));
        assert_eq!(winner.status, RunStatus::Cancelled);
        assert_eq!(h.executor.requests().len(), 1);
        assert_eq!(h.orchestrator.active_runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_run_releases_its_request_id() {
        let h = harness(
            vec![plan("single", &["billing"]), plan("single", &["billing"])],
            vec![],
            MockAgent::new().with(
                "billing",
                AgentScript::reply("done").delayed(Duration::from_secs(2)),
            ),
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            h.orchestrator.run(request("first", "req_1")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(h.orchestrator.active_runs(), 0);
        let session = h
            .orchestrator
            .streams()
            .get_session_by_request(&RequestId::from_raw("req_1"))
            .unwrap();
        assert_eq!(session.state(), SessionState::Cancelled);

        let outcome = h.orchestrator.run(request("again", "req_1")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn long_histories_are_summarized_after_the_run() {
        let streams = Arc::new(StreamManager::new(StreamConfig::default()));
        let summary_model = Arc::new(MockChatModel::with_texts(["they asked about invoices"]));
        let memory = MemoryManager::new(Arc::new(EphemeralStore::new()), MemoryConfig::default())
            .with_summarizer(Arc::new(Summarizer::new(
                summary_model.clone(),
                SummarizerConfig {
                    max_turns_before_summary: 3,
                    recent_turns: 1,
                    ..Default::default()
                },
            )));
        let orchestrator = Orchestrator::new(
            QueryAnalyzer::new(Arc::new(MockChatModel::new(vec![
                plan("single", &["billing"]),
                plan("single", &["billing"]),
            ]))),
            Dispatcher::new(
                Arc::new(MockAgent::new().with("billing", AgentScript::reply("answer"))),
                Arc::new(MockChatModel::new(vec![])),
                DispatchConfig::default(),
            ),
            ResultConsolidator::new(Arc::new(MockChatModel::new(vec![]))),
            memory,
            streams,
        );

        orchestrator.run(request("q1", "req_1")).await.unwrap();
        assert_eq!(summary_model.call_count(), 0);
        orchestrator.run(request("q2", "req_2")).await.unwrap();
        assert_eq!(summary_model.call_count(), 1);

        let history = orchestrator.memory().history(&key()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "answer");
    }
}
