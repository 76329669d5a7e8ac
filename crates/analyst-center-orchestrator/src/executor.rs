use analyst_center_domain::RequestState;
use tracing::{debug, warn};

/// Next hop chosen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Plan,
    Dispatch {
        capability: String,
        instruction: String,
    },
    Finalize,
}

/// One executor decision over the current state.
///
/// Rules, in priority order:
/// 1. a pending replan request is honored while replans remain; once they
///    are exhausted replanning is disabled for the rest of the request
/// 2. a step index past the end of the plan finalizes
/// 3. a step whose capability authored the latest message is complete, so the
///    index advances (and rule 2 is re-checked)
/// 4. otherwise the current step is dispatched
pub fn decide(state: &mut RequestState, max_replans: u32) -> Route {
    if state.replan_requested {
        state.replan_requested = false;
        if !state.replanning_disabled && state.replan_count < max_replans {
            state.replan_count += 1;
            debug!(replan_count = state.replan_count, "routing to planner for replan");
            return Route::Plan;
        }
        if !state.replanning_disabled {
            warn!(max_replans, "replan limit reached; continuing with current plan");
            state.replanning_disabled = true;
        }
    }

    if state.current_step > state.plan.len() {
        return Route::Finalize;
    }

    let step_completed = match (state.latest_message(), state.current_step_definition()) {
        (Some(message), Some(step)) => message.author == step.capability,
        _ => false,
    };
    if step_completed {
        state.current_step += 1;
        if state.current_step > state.plan.len() {
            return Route::Finalize;
        }
    }

    let Some(step) = state.current_step_definition() else {
        warn!(step = state.current_step, "current step missing from plan; finalizing");
        return Route::Finalize;
    };
    if !state.is_enabled(&step.capability) {
        warn!(
            step = state.current_step,
            capability = %step.capability,
            "plan names an unknown or disabled capability; finalizing"
        );
        return Route::Finalize;
    }

    let instruction = step_instruction(state);
    let capability = step.capability.clone();
    debug!(step = state.current_step, %capability, "dispatching step");
    Route::Dispatch {
        capability,
        instruction,
    }
}

fn step_instruction(state: &RequestState) -> String {
    let action = state
        .current_step_definition()
        .map(|step| step.action.as_str())
        .unwrap_or_default();
    format!(
        "User request: {}\n\nCurrent step ({}/{}): {}\n\nOutputs from earlier steps are visible in the conversation history.",
        state.user_query,
        state.current_step,
        state.plan.len(),
        action
    )
}
