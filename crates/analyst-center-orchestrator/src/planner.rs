use std::collections::BTreeMap;

use analyst_center_capability::{render_history, CapabilityRegistry};
use analyst_center_domain::{
    extract_first_json_object, strip_thinking, Deadline, Message, OrchestratorError, Plan,
    PlanningTrace, RequestState, Step, EXECUTION_TRACE_MARKER, PLANNER_TAG,
};
use analyst_center_provider::{GenerationRequest, TextGenerator};
use serde_json::Value;
use tracing::info;

const SYSTEM_PROMPT: &str = "You are the planner of a data-analysis assistant. Break the user \
request into an ordered plan that uses only the listed capabilities. Respond with one JSON \
object: {\"plan\": {\"1\": {\"agent\": \"<capability>\", \"action\": \"<what to do>\"}, ...}, \
\"reasoning\": \"<one sentence>\"}. Step keys are consecutive integers starting at 1.";

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlan {
    pub plan: Plan,
    pub reasoning: Option<String>,
}

/// Invoke the reasoning model once and install the resulting plan on `state`.
///
/// # Errors
/// Returns `PlanParse` when the response holds no usable plan, or the
/// generator's `Transport`/`Timeout` error.
pub fn run_planner(
    state: &mut RequestState,
    generator: &dyn TextGenerator,
    registry: &CapabilityRegistry<'_>,
    model_id: &str,
    deadline: &Deadline,
) -> Result<(), OrchestratorError> {
    let prompt = build_prompt(state, registry);
    let request = GenerationRequest::new(model_id, SYSTEM_PROMPT, prompt).expecting_json();
    let generation = generator.generate(&request, deadline)?;
    let parsed = parse_plan(&generation.text)?;

    let plan_json = serde_json::to_value(&parsed.plan)
        .map_err(|err| OrchestratorError::PlanParse(format!("plan is not serializable: {err}")))?;
    let trace = serde_json::to_value(PlanningTrace {
        plan: plan_json,
        reasoning_model: model_id.to_string(),
    })
    .map_err(|err| OrchestratorError::PlanParse(format!("planning trace is not serializable: {err}")))?;

    info!(
        steps = parsed.plan.len(),
        replan_count = state.replan_count,
        model_id,
        "plan accepted"
    );

    if !state.is_replanning() {
        state.current_step = 1;
    }
    state.plan = parsed.plan;
    state
        .model_usage
        .insert(PLANNER_TAG.to_string(), model_id.to_string());
    state.replan_requested = false;

    let content = format!(
        "{}\n\n{EXECUTION_TRACE_MARKER} {trace}",
        describe_plan(&state.plan, parsed.reasoning.as_deref(), state.replan_count)
    );
    state.append_message(Message::completed(PLANNER_TAG, content));
    Ok(())
}

fn build_prompt(state: &RequestState, registry: &CapabilityRegistry<'_>) -> String {
    let capabilities = state
        .enabled_capabilities
        .iter()
        .map(|name| {
            format!(
                "- {name}: {}",
                registry.description(name).unwrap_or("no description")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = format!(
        "User request: {}\n\nAvailable capabilities:\n{capabilities}",
        state.user_query
    );
    if state.is_replanning() {
        let previous = serde_json::to_string_pretty(&state.plan).unwrap_or_default();
        prompt.push_str(&format!(
            "\n\nThe previous plan needs revision.\nPrevious plan:\n{previous}\n\n\
             Execution is at step {current}. Keep steps 1 to {kept} as they are and \
             replace step {current} onward so the plan can continue from here.\n\n\
             Conversation so far:\n{history}",
            current = state.current_step,
            kept = state.current_step.saturating_sub(1),
            history = render_history(state.history()),
        ));
    }
    prompt
}

/// Parse either `{"plan": {"1": {..}}}` or `{"steps": [{..}]}`.
///
/// # Errors
/// Returns `PlanParse` for any other shape, non-contiguous keys, or an empty plan.
pub fn parse_plan(text: &str) -> Result<ParsedPlan, OrchestratorError> {
    let value = extract_first_json_object(&strip_thinking(text))
        .map_err(|err| OrchestratorError::PlanParse(format!("no JSON object in planner output: {err}")))?;

    let plan = match (value.get("plan"), value.get("steps")) {
        (Some(Value::Object(indexed)), _) => {
            let mut steps = BTreeMap::new();
            for (key, raw) in indexed {
                let index: usize = key.trim().parse().map_err(|_| {
                    OrchestratorError::PlanParse(format!("plan key `{key}` is not a step number"))
                })?;
                if steps.insert(index, decode_step(raw)?).is_some() {
                    return Err(OrchestratorError::PlanParse(format!(
                        "plan step {index} appears more than once"
                    )));
                }
            }
            Plan::from_indexed(steps)?
        }
        (_, Some(Value::Array(items))) => {
            Plan::from_steps(items.iter().map(decode_step).collect::<Result<Vec<_>, _>>()?)
        }
        _ => {
            return Err(OrchestratorError::PlanParse(
                "planner output has neither a `plan` object nor a `steps` array".to_string(),
            ))
        }
    };

    if plan.is_empty() {
        return Err(OrchestratorError::PlanParse("plan has no steps".to_string()));
    }

    Ok(ParsedPlan {
        plan,
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_step(raw: &Value) -> Result<Step, OrchestratorError> {
    let step: Step = serde_json::from_value(raw.clone())
        .map_err(|err| OrchestratorError::PlanParse(format!("invalid plan step: {err}")))?;
    if step.capability.trim().is_empty() {
        return Err(OrchestratorError::PlanParse(
            "plan step names no capability".to_string(),
        ));
    }
    Ok(Step {
        capability: step.capability.trim().to_string(),
        action: step.action,
    })
}

fn describe_plan(plan: &Plan, reasoning: Option<&str>, revision: u32) -> String {
    let mut out = if revision == 0 {
        "Plan:".to_string()
    } else {
        format!("Revised plan ({revision}):")
    };
    for (index, step) in plan.iter() {
        out.push_str(&format!("\n{index}. {}: {}", step.capability, step.action));
    }
    if let Some(reasoning) = reasoning {
        out.push_str(&format!("\n\nReasoning: {reasoning}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::parse_plan;
    use analyst_center_domain::OrchestratorError;

    #[test]
    fn indexed_plan_with_agent_or_capability_keys_is_accepted() {
        let parsed = parse_plan(
            "<think>two steps</think>```json\n{\"plan\": {\"2\": {\"capability\": \"writer\", \"action\": \"answer\"}, \"1\": {\"agent\": \"sql\", \"action\": \"count\"}}, \"reasoning\": \"data first\"}\n```",
        );
        let parsed = parsed.unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.plan.len(), 2);
        assert_eq!(parsed.plan.get(1).map(|step| step.capability.as_str()), Some("sql"));
        assert_eq!(parsed.plan.get(2).map(|step| step.capability.as_str()), Some("writer"));
        assert_eq!(parsed.reasoning.as_deref(), Some("data first"));
    }

    #[test]
    fn steps_array_is_accepted() {
        let parsed = parse_plan(r#"{"steps": [{"agent": "web", "action": "look up"}]}"#);
        assert_eq!(parsed.map(|parsed| parsed.plan.len()).ok(), Some(1));
    }

    #[test]
    fn malformed_plans_are_plan_parse_errors() {
        for text in [
            "no json at all",
            r#"{"plan": {"1": {"agent": "sql", "action": "a"}, "3": {"agent": "sql", "action": "b"}}}"#,
            r#"{"plan": {"first": {"agent": "sql", "action": "a"}}}"#,
            r#"{"plan": {}}"#,
            r#"{"plan": {"1": {"action": "missing agent"}}}"#,
            r#"{"answer": "skip planning"}"#,
        ] {
            assert!(
                matches!(parse_plan(text), Err(OrchestratorError::PlanParse(_))),
                "expected PlanParse for {text}"
            );
        }
    }
}
