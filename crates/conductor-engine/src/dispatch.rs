use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conductor_core::agent::{AgentDefinition, AgentExecutor, AgentProfile, AgentRequest, EventSink};
use conductor_core::chat::{complete_with_cancel, ChatModel, ChatOptions};
use conductor_core::errors::GatewayError;
use conductor_core::events::StreamEvent;
use conductor_core::ids::AgentId;
use conductor_core::turns::{ConversationTurn, Role};

use crate::error::EngineError;
use crate::execution::{AgentResult, ExecutionResult};
use crate::extract::decode_object;
use crate::routing::prompts::{render_agent_profiles, COORDINATOR_INSTRUCTION};
use crate::routing::{QueryAnalysisResult, SubQuestion, WorkflowKind};

const SUPERVISOR_NAME: &str = "supervisor";

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Upper bound on one agent execution.
    pub agent_timeout: Duration,
    /// Supervisor decisions allowed in a sequential run.
    pub max_steps: u32,
    pub supervisor_options: ChatOptions,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(120),
            max_steps: 20,
            supervisor_options: ChatOptions::default(),
        }
    }
}

/// What one dispatch works on.
#[derive(Clone, Copy, Debug)]
pub struct DispatchInput<'a> {
    pub plan: &'a QueryAnalysisResult,
    /// Agents the plan may refer to.
    pub agents: &'a [AgentDefinition],
    /// Context messages, ending with the user's turn.
    pub context: &'a [ConversationTurn],
    pub query: &'a str,
}

#[derive(Deserialize)]
struct SupervisorDecision {
    #[serde(default)]
    next_agent: Option<String>,
    #[serde(default)]
    final_answer: Option<String>,
}

/// Runs the agents a plan selected, in the plan's topology.
pub struct Dispatcher {
    executor: Arc<dyn AgentExecutor>,
    supervisor: Arc<dyn ChatModel>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        supervisor: Arc<dyn ChatModel>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            executor,
            supervisor,
            config,
        }
    }

    #[instrument(skip_all, fields(workflow = %input.plan.workflow, agents = input.plan.selected_agent_ids.len()))]
    pub async fn run(
        &self,
        input: DispatchInput<'_>,
        cancel: &CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<ExecutionResult, EngineError> {
        if input.plan.selected_agent_ids.is_empty() {
            return Err(EngineError::NoAgents);
        }
        let workflow = input.plan.workflow;
        match workflow {
            WorkflowKind::Single => self.run_single(input, cancel, sink).await,
            WorkflowKind::Parallel => self.run_parallel(input, cancel, sink).await,
            _ => self.run_supervised(input, cancel, sink).await,
        }
    }

    async fn run_single(
        &self,
        input: DispatchInput<'_>,
        cancel: &CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<ExecutionResult, EngineError> {
        let agent_id = &input.plan.selected_agent_ids[0];
        let sub_question = input
            .plan
            .sub_questions
            .iter()
            .find(|sq| &sq.assigned_agent_id == agent_id)
            .cloned();
        let result = match find_agent(input.agents, agent_id) {
            Some(agent) => {
                let question = sub_question.as_ref().map(|sq| sq.question.as_str());
                let request = AgentRequest::for_agent(agent, messages_for(input.context, question));
                execute_agent(
                    self.executor.clone(),
                    request,
                    sink,
                    cancel.child_token(),
                    self.config.agent_timeout,
                )
                .await
            }
            None => unknown_agent(agent_id),
        };
        Ok(ExecutionResult::new(
            vec![result.with_sub_question(sub_question)],
            WorkflowKind::Single,
        ))
    }

    /// One task per selected agent, in selection order. An agent with a
    /// sub-question answers that; the others get the full query.
    async fn run_parallel(
        &self,
        input: DispatchInput<'_>,
        cancel: &CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<ExecutionResult, EngineError> {
        let units: Vec<(AgentId, Option<SubQuestion>)> = input
            .plan
            .selected_agent_ids
            .iter()
            .map(|id| {
                let sub_question = input
                    .plan
                    .sub_questions
                    .iter()
                    .find(|sq| &sq.assigned_agent_id == id)
                    .cloned();
                (id.clone(), sub_question)
            })
            .collect();

        let batch = cancel.child_token();
        let mut slots: Vec<Option<AgentResult>> = (0..units.len()).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (idx, (agent_id, sub_question)) in units.iter().enumerate() {
            let Some(agent) = find_agent(input.agents, agent_id) else {
                slots[idx] = Some(unknown_agent(agent_id).with_sub_question(sub_question.clone()));
                continue;
            };
            let question = sub_question.as_ref().map(|sq| sq.question.as_str());
            let request = AgentRequest::for_agent(agent, messages_for(input.context, question));
            let executor = self.executor.clone();
            let sink = sink.clone();
            let token = batch.child_token();
            let timeout = self.config.agent_timeout;
            tasks.spawn(async move {
                (idx, execute_agent(executor, request, sink, token, timeout).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "agent task did not finish"),
            }
        }

        let results = slots
            .into_iter()
            .zip(units)
            .map(|(slot, (agent_id, sub_question))| {
                slot.unwrap_or_else(|| {
                    AgentResult::failed(agent_id, GatewayError::Agent("agent task aborted".into()))
                })
                .with_sub_question(sub_question)
            })
            .collect::<Vec<_>>();

        let execution = ExecutionResult::new(results, WorkflowKind::Parallel);
        info!(
            total = execution.results.len(),
            succeeded = execution.success_count(),
            "parallel batch finished"
        );
        Ok(execution)
    }

    /// Supervisor loop: ask who runs next, run it, feed the result back.
    async fn run_supervised(
        &self,
        input: DispatchInput<'_>,
        cancel: &CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<ExecutionResult, EngineError> {
        let order: Vec<&AgentDefinition> = input
            .plan
            .selected_agent_ids
            .iter()
            .filter_map(|id| {
                let agent = find_agent(input.agents, id);
                if agent.is_none() {
                    warn!(agent = %id, "selected agent is not defined, skipping");
                }
                agent
            })
            .collect();
        if order.is_empty() {
            return Err(EngineError::NoAgents);
        }
        let by_id: HashMap<&str, &AgentDefinition> =
            order.iter().map(|a| (a.id().as_str(), *a)).collect();

        let profiles: Vec<AgentProfile> = order.iter().map(|a| a.profile.clone()).collect();
        let mut transcript = vec![
            ConversationTurn::system(
                COORDINATOR_INSTRUCTION.replace("{agent_profiles}", &render_agent_profiles(&profiles)),
            ),
            ConversationTurn::user(input.query),
        ];

        let mut results: Vec<AgentResult> = Vec::new();
        let mut ran: HashSet<AgentId> = HashSet::new();
        let mut current = SUPERVISOR_NAME.to_string();
        let mut final_answer = None;
        let mut finished = false;

        for step in 1..=self.config.max_steps {
            if cancel.is_cancelled() {
                info!(step, "sequential run cancelled");
                finished = true;
                break;
            }

            let decision = match complete_with_cancel(
                self.supervisor.as_ref(),
                &transcript,
                &self.config.supervisor_options,
                cancel,
            )
            .await
            {
                Ok(raw) => {
                    transcript.push(ConversationTurn::assistant(raw.clone()));
                    decode_object::<SupervisorDecision>(&raw).ok()
                }
                Err(GatewayError::Cancelled) => {
                    finished = true;
                    break;
                }
                Err(e) => {
                    warn!(step, error = %e, "supervisor call failed");
                    None
                }
            };

            let requested = decision
                .as_ref()
                .and_then(|d| d.next_agent.as_deref())
                .and_then(|id| by_id.get(id).copied());
            let answer = decision
                .and_then(|d| d.final_answer)
                .filter(|a| !a.trim().is_empty());

            let next = match (requested, answer) {
                (Some(agent), _) => agent,
                (None, Some(answer)) if !results.is_empty() => {
                    final_answer = Some(answer);
                    finished = true;
                    break;
                }
                _ => match order.iter().find(|a| !ran.contains(a.id())) {
                    Some(agent) => *agent,
                    None => {
                        debug!(step, "every agent ran and the supervisor added nothing");
                        finished = true;
                        break;
                    }
                },
            };

            sink.emit(StreamEvent::transfer(current.as_str(), next.name()));
            current = next.name().to_string();

            let brief = step_brief(input.query, &results, &by_id);
            let request = AgentRequest::for_agent(next, messages_for(input.context, Some(&brief)));
            let result = execute_agent(
                self.executor.clone(),
                request,
                sink.clone(),
                cancel.child_token(),
                self.config.agent_timeout,
            )
            .await;

            transcript.push(ConversationTurn::user(step_report(next.name(), &result)));
            ran.insert(result.agent_id.clone());
            results.push(result);
        }

        if !finished {
            warn!(max_steps = self.config.max_steps, "supervisor step budget exhausted");
            if results.is_empty() {
                return Err(EngineError::StepBudgetExhausted(self.config.max_steps));
            }
        }

        Ok(ExecutionResult::new(results, input.plan.workflow).with_final_answer(final_answer))
    }
}

async fn execute_agent(
    executor: Arc<dyn AgentExecutor>,
    request: AgentRequest,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    timeout: Duration,
) -> AgentResult {
    let agent_id = request.agent_id.clone();
    let agent_name = request.agent_name.clone();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = tokio::time::timeout(timeout, executor.execute(request, sink.clone())) => {
            result.unwrap_or(Err(GatewayError::Timeout(timeout)))
        }
    };
    match outcome {
        Ok(reply) => {
            debug!(agent = %agent_id, len = reply.content.len(), "agent replied");
            AgentResult::ok(agent_id, reply.content)
        }
        Err(e) => {
            warn!(agent = %agent_id, error = %e, "agent execution failed");
            if !matches!(e, GatewayError::Cancelled) {
                sink.emit(StreamEvent::error(Some(agent_name), e.to_string()));
            }
            AgentResult::failed(agent_id, e)
        }
    }
}

fn find_agent<'a>(agents: &'a [AgentDefinition], id: &AgentId) -> Option<&'a AgentDefinition> {
    agents.iter().find(|a| a.id() == id)
}

fn unknown_agent(id: &AgentId) -> AgentResult {
    AgentResult::failed(id.clone(), GatewayError::Agent(format!("agent {id} is not defined")))
}

/// Context messages for one agent. A question replaces the trailing user turn.
fn messages_for(context: &[ConversationTurn], question: Option<&str>) -> Vec<ConversationTurn> {
    let mut messages = context.to_vec();
    let Some(question) = question else {
        return messages;
    };
    match messages.last_mut() {
        Some(last) if last.role == Role::User => last.content = question.to_string(),
        _ => messages.push(ConversationTurn::user(question)),
    }
    messages
}

fn step_brief(query: &str, results: &[AgentResult], by_id: &HashMap<&str, &AgentDefinition>) -> String {
    if results.is_empty() {
        return query.to_string();
    }
    let mut brief = format!("{query}\n\nWork done so far:\n");
    for result in results {
        let name = by_id
            .get(result.agent_id.as_str())
            .map(|a| a.name())
            .unwrap_or(result.agent_id.as_str());
        let _ = writeln!(brief, "{}", step_report(name, result));
    }
    brief
}

fn step_report(agent_name: &str, result: &AgentResult) -> String {
    match &result.error {
        Some(e) => format!("[{agent_name}] failed: {e}"),
        None => format!("[{agent_name}] {}", result.content),
    }
}
