//! Prompt templates for the analysis, consolidation and summary calls.

use conductor_core::agent::AgentProfile;

pub const QUERY_ANALYZER_PROMPT: &str = r#"You are a query analysis expert. Analyze the user's question, decide its intent and complexity, and choose the most suitable agent(s) to handle it.

## Available agents

{agent_profiles}

## What to decide

1. Intent: what does the user want? A question, a task, or small talk?
2. Complexity:
   - simple: one intent, one agent can handle it
   - complex: several intents, or several agents must cooperate
3. Agent selection: pick the agent(s) whose description best fits the question.
4. Workflow:
   - single: one agent handles the query
   - parallel: several agents answer independent parts at the same time
   - sequential: several agents run in order because later steps depend on earlier ones

## Output

Reply with this JSON object and nothing else:

{
  "selected_agent_ids": ["agent-id-1"],
  "selection_reasoning": "why this agent",
  "workflow": "single",
  "workflow_reasoning": "why this workflow",
  "confidence_score": 0.95,
  "is_complex": false,
  "sub_questions": []
}

For a query with several intents, split it into sub-questions:

{
  "selected_agent_ids": ["agent-1", "agent-2"],
  "selection_reasoning": "the question spans two domains",
  "workflow": "parallel",
  "workflow_reasoning": "the two parts are independent",
  "confidence_score": 0.85,
  "is_complex": true,
  "sub_questions": [
    {"id": "sq-1", "question": "first part", "intent": "first intent", "assigned_agent_id": "agent-1"},
    {"id": "sq-2", "question": "second part", "intent": "second intent", "assigned_agent_id": "agent-2"}
  ]
}

## Notes

1. If only one agent is available, select it with workflow "single".
2. Clear, simple questions deserve a high confidence_score (above 0.9).
3. Vague questions that need clarification deserve a low confidence_score (below 0.7).
4. Always prefer the agent that best matches the user's intent.
{intent_hint}
User question: {user_query}
"#;

const AGENT_PROFILE_TEMPLATE: &str = "- ID: {id}\n  Name: {name}\n  Description: {description}\n";

pub const NO_AGENTS_TEXT: &str = "(no available agents)";

pub const CONSOLIDATION_SYSTEM_PROMPT: &str = r#"You merge the results of several sub-tasks into one complete, coherent answer.

Requirements:
1. Integrate every result into a single complete answer.
2. Remove duplicated information.
3. If a sub-task failed, say that this part of the information is not available right now.
4. Answer the user's original question directly.
5. Never mention internal concepts such as "sub-task" or "Result 1".

Reply with the merged answer only."#;

pub const CONSOLIDATION_USER_PROMPT: &str = "## Original question\n{original_query}\n\n## Sub-task results\n{results_content}";

pub const CONFLICT_DETECTION_SYSTEM_PROMPT: &str = r#"You check whether answers from several sources conflict with each other.

Look for:
1. Factual conflicts (numbers, dates, names that disagree)
2. Contradictory advice on the same question
3. Inconsistent descriptions of the same thing

Reply with this JSON object and nothing else:
{
  "has_conflict": true,
  "conflict_description": "what conflicts (empty when none)",
  "conflicting_sources": [1, 2],
  "resolution_suggestion": "how to resolve it (empty when none)",
  "consensus_points": ["point the sources agree on"]
}"#;

pub const CONFLICT_DETECTION_USER_PROMPT: &str =
    "## Original question\n{original_query}\n\n## Answers by source\n{results_content}\n\nDo these answers conflict?";

pub const SUMMARY_PROMPT: &str = r#"You compress long conversation histories into short summaries.

Requirements:
1. Keep key information: the user's main questions, decisions made, conclusions reached.
2. Keep context: user preferences, resolved issues, open items.
3. Drop redundancy: repeated confirmations, small talk, outdated information.
4. Use short bullet points.

Compress this conversation:

{conversation}

Reply with the summary only."#;

pub const COORDINATOR_INSTRUCTION: &str = r#"You are a coordinator that answers the user by delegating to specialist agents.

Rules:
1. Run the agents one at a time, in the order listed below.
2. Pass what earlier agents produced on to the next one.
3. Never call agents in parallel.
4. When every needed agent has run, summarize their work into the final answer and finish.
5. Always delegate; do not answer the user's question yourself.

Agents, in order:
{agent_profiles}

Reply with one JSON object and nothing else:
{"next_agent": "<agent id>", "final_answer": null}
to delegate, or
{"next_agent": null, "final_answer": "<answer for the user>"}
to finish."#;

/// Render the agent list block shared by the analyzer and coordinator prompts.
pub fn render_agent_profiles(agents: &[AgentProfile]) -> String {
    if agents.is_empty() {
        return NO_AGENTS_TEXT.to_string();
    }
    agents
        .iter()
        .map(|agent| {
            AGENT_PROFILE_TEMPLATE
                .replace("{id}", agent.id.as_str())
                .replace("{name}", &agent.name)
                .replace("{description}", &agent.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_analyzer_prompt(agents: &[AgentProfile], query: &str, intent_hint: Option<&str>) -> String {
    let hint = match intent_hint {
        Some(intent) => format!("\nA keyword pre-check classified this question as intent \"{intent}\".\n"),
        None => String::new(),
    };
    QUERY_ANALYZER_PROMPT
        .replace("{agent_profiles}", &render_agent_profiles(agents))
        .replace("{intent_hint}", &hint)
        .replace("{user_query}", query)
}
