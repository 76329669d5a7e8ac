use std::collections::BTreeMap;

use analyst_center_domain::{
    strip_trailing_payloads, CapabilityKind, Message, MessageStatus, RequestState, RunMetadata,
    RunResponse, CHART_SPEC_MARKER, EXECUTION_TRACE_MARKER,
};
use analyst_center_trace::{aggregate_trace, extract_visualizations};

/// Build the outward response from a terminal request state.
#[must_use]
pub fn assemble_response(
    state: &RequestState,
    kinds: &BTreeMap<String, CapabilityKind>,
) -> RunResponse {
    RunResponse {
        run_id: state.run_id,
        answer: final_answer(state.history(), kinds),
        visualization_specs: extract_visualizations(state.history(), kinds),
        trace_records: aggregate_trace(state.history(), kinds),
        metadata: RunMetadata {
            models_used: state.model_usage.clone(),
            step_count: state.plan.len(),
            replan_count: state.replan_count,
        },
    }
}

/// The last summarization output, else the last completed capability output
/// with embedded payloads removed, else empty.
#[must_use]
pub fn final_answer(history: &[Message], kinds: &BTreeMap<String, CapabilityKind>) -> String {
    let completed_capability = |message: &&Message| {
        message.status == MessageStatus::Completed && kinds.contains_key(&message.author)
    };

    if let Some(summary) = history.iter().rev().filter(completed_capability).find(|message| {
        kinds.get(&message.author) == Some(&CapabilityKind::Summarization)
    }) {
        return summary.content.clone();
    }

    history
        .iter()
        .rev()
        .find(completed_capability)
        .map(|message| {
            strip_trailing_payloads(&message.content, &[EXECUTION_TRACE_MARKER, CHART_SPEC_MARKER])
        })
        .unwrap_or_default()
}
