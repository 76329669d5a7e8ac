#![forbid(unsafe_code)]

//! Capability adapters invoked by the executor, one per configured capability.
//!
//! Every invocation appends exactly one message authored by the capability's
//! configured name. Structured trace payloads travel on that message's last
//! line after `EXECUTION_TRACE:`; chart specifications after `CHART_SPEC:`.

use std::collections::BTreeMap;

use analyst_center_domain::{
    strip_trailing_payloads, truncate_chars, AnalystConfig, CapabilityKind, Deadline, Message,
    OrchestratorError, CHART_SPEC_MARKER, EXECUTION_TRACE_MARKER,
};
use analyst_center_provider::{SearchService, TextGenerator};
use analyst_center_sql_guard::{DataStore, SqlGuard};
use serde_json::Value;

mod query;
mod search;
mod summarize;
mod visualize;

pub use query::QueryCapability;
pub use search::SearchCapability;
pub use summarize::SummarizationCapability;
pub use visualize::VisualizationCapability;

const HISTORY_ENTRY_MAX_CHARS: usize = 4_000;

/// External services shared by all capabilities of one orchestrator.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub generator: &'a dyn TextGenerator,
    pub data_store: Option<&'a dyn DataStore>,
    pub search: Option<&'a dyn SearchService>,
}

/// Per-invocation input.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityCall<'c> {
    pub user_query: &'c str,
    /// Action text of the current plan step.
    pub action: &'c str,
    pub instruction: &'c str,
    pub history: &'c [Message],
    pub model_id: &'c str,
    pub deadline: &'c Deadline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityOutput {
    pub message: Message,
    /// Trace payload entries also embedded in `message`.
    pub traces: Vec<Value>,
}

pub enum CapabilityAdapter<'a> {
    Query(QueryCapability<'a>),
    Search(SearchCapability<'a>),
    Visualization(VisualizationCapability<'a>),
    Summarization(SummarizationCapability<'a>),
}

impl CapabilityAdapter<'_> {
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Query(_) => CapabilityKind::Query,
            Self::Search(_) => CapabilityKind::Search,
            Self::Visualization(_) => CapabilityKind::Visualization,
            Self::Summarization(_) => CapabilityKind::Summarization,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Query(capability) => &capability.name,
            Self::Search(capability) => &capability.name,
            Self::Visualization(capability) => &capability.name,
            Self::Summarization(capability) => &capability.name,
        }
    }

    /// Run one step. Recoverable failures come back as a `failed` message.
    ///
    /// # Errors
    /// Returns `Transport` or `Timeout` when an external call fails fatally.
    pub fn invoke(&self, call: &CapabilityCall<'_>) -> Result<CapabilityOutput, OrchestratorError> {
        match self {
            Self::Query(capability) => capability.invoke(call),
            Self::Search(capability) => capability.invoke(call),
            Self::Visualization(capability) => capability.invoke(call),
            Self::Summarization(capability) => capability.invoke(call),
        }
    }
}

/// Capability adapters resolved once from configuration.
pub struct CapabilityRegistry<'a> {
    adapters: BTreeMap<String, CapabilityAdapter<'a>>,
    descriptions: BTreeMap<String, String>,
    default_models: BTreeMap<String, String>,
}

impl<'a> CapabilityRegistry<'a> {
    /// Build one adapter per configured capability.
    ///
    /// # Errors
    /// Returns `Configuration` when a capability needs a collaborator that was
    /// not supplied.
    pub fn build(
        config: &AnalystConfig,
        collaborators: Collaborators<'a>,
    ) -> Result<Self, OrchestratorError> {
        let mut adapters = BTreeMap::new();
        let mut descriptions = BTreeMap::new();
        let mut default_models = BTreeMap::new();

        for definition in &config.capabilities {
            let name = definition.name.clone();
            let adapter = match definition.kind {
                CapabilityKind::Query => {
                    let store = collaborators.data_store.ok_or_else(|| {
                        OrchestratorError::Configuration(format!(
                            "capability `{name}` requires a data store"
                        ))
                    })?;
                    CapabilityAdapter::Query(QueryCapability::new(
                        &name,
                        collaborators.generator,
                        store,
                        SqlGuard::new(config.limits.row_cap),
                        definition.max_attempts,
                        config.limits.sample_rows,
                    ))
                }
                CapabilityKind::Search => {
                    let search = collaborators.search.ok_or_else(|| {
                        OrchestratorError::Configuration(format!(
                            "capability `{name}` requires a search service"
                        ))
                    })?;
                    CapabilityAdapter::Search(SearchCapability::new(
                        &name,
                        collaborators.generator,
                        search,
                    ))
                }
                CapabilityKind::Visualization => CapabilityAdapter::Visualization(
                    VisualizationCapability::new(&name, collaborators.generator),
                ),
                CapabilityKind::Summarization => CapabilityAdapter::Summarization(
                    SummarizationCapability::new(&name, collaborators.generator),
                ),
            };
            descriptions.insert(name.clone(), definition.description.clone());
            default_models.insert(name.clone(), definition.model_id.clone());
            adapters.insert(name, adapter);
        }

        Ok(Self {
            adapters,
            descriptions,
            default_models,
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CapabilityAdapter<'a>> {
        self.adapters.get(name)
    }

    #[must_use]
    pub fn description(&self, name: &str) -> Option<&str> {
        self.descriptions.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn default_model(&self, name: &str) -> Option<&str> {
        self.default_models.get(name).map(String::as_str)
    }

    /// Capability kinds by name, as needed by trace aggregation and response assembly.
    #[must_use]
    pub fn kinds(&self) -> BTreeMap<String, CapabilityKind> {
        self.adapters
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.kind()))
            .collect()
    }
}

/// Render history for prompting, with embedded payloads removed.
#[must_use]
pub fn render_history(history: &[Message]) -> String {
    if history.is_empty() {
        return "(no earlier messages)".to_string();
    }
    history
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let body =
                strip_trailing_payloads(&message.content, &[EXECUTION_TRACE_MARKER, CHART_SPEC_MARKER]);
            format!(
                "[{}] {} ({}):\n{}",
                index + 1,
                message.author,
                message.status.as_str(),
                truncate_chars(&body, HISTORY_ENTRY_MAX_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Append an `EXECUTION_TRACE:` line carrying `entries` as a JSON array.
pub(crate) fn with_trace_line(prose: &str, entries: &[Value]) -> String {
    format!(
        "{prose}\n\n{EXECUTION_TRACE_MARKER} {}",
        Value::Array(entries.to_vec())
    )
}

#[cfg(test)]
mod tests {
    use super::{render_history, with_trace_line};
    use analyst_center_domain::{extract_trailing_payload, Message, EXECUTION_TRACE_MARKER};
    use serde_json::json;

    #[test]
    fn rendered_history_hides_embedded_payloads() {
        let history = vec![
            Message::completed("planner", "Plan:\n1. sql\n\nEXECUTION_TRACE: {\"plan\": {}}".to_string()),
            Message::failed("sql", "Could not query.".to_string()),
        ];
        let rendered = render_history(&history);
        assert!(rendered.contains("[1] planner (completed):\nPlan:\n1. sql"));
        assert!(rendered.contains("[2] sql (failed):\nCould not query."));
        assert!(!rendered.contains(EXECUTION_TRACE_MARKER));
    }

    #[test]
    fn marker_text_in_prose_does_not_truncate_history() {
        let prose = "1. Notes (https://n.example): EXECUTION_TRACE: [] then the rest\nSecond line.";
        let history = vec![Message::completed(
            "web",
            with_trace_line(prose, &[json!({"search_query": "q", "sources": []})]),
        )];
        let rendered = render_history(&history);
        assert!(rendered.ends_with(&format!("[1] web (completed):\n{prose}")));
    }

    #[test]
    fn trace_line_round_trips_through_the_scanner() {
        let entries = vec![json!({"search_query": "q", "sources": [{"url": "u}"}]})];
        let content = with_trace_line("Found 1 source.", &entries);
        assert_eq!(
            extract_trailing_payload(&content, EXECUTION_TRACE_MARKER),
            Ok(json!(entries))
        );
    }
}
