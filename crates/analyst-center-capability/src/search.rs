use analyst_center_domain::{
    extract_first_json_object, strip_thinking, Message, OrchestratorError, SearchResponse,
};
use analyst_center_provider::{GenerationRequest, SearchService, TextGenerator};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{render_history, with_trace_line, CapabilityCall, CapabilityOutput};

const SYSTEM_PROMPT: &str = "You write concise web search queries. Respond with one JSON \
object: {\"query\": \"...\"}.";

pub struct SearchCapability<'a> {
    pub(crate) name: String,
    generator: &'a dyn TextGenerator,
    search: &'a dyn SearchService,
}

impl<'a> SearchCapability<'a> {
    #[must_use]
    pub fn new(name: &str, generator: &'a dyn TextGenerator, search: &'a dyn SearchService) -> Self {
        Self {
            name: name.to_string(),
            generator,
            search,
        }
    }

    pub(crate) fn invoke(
        &self,
        call: &CapabilityCall<'_>,
    ) -> Result<CapabilityOutput, OrchestratorError> {
        let prompt = format!(
            "{}\n\nConversation so far:\n{}",
            call.instruction,
            render_history(call.history)
        );
        let request =
            GenerationRequest::new(call.model_id, SYSTEM_PROMPT, prompt).expecting_json();
        let generation = self.generator.generate(&request, call.deadline)?;
        let search_query = proposed_query(&generation.text).unwrap_or_else(|| {
            warn!(capability = %self.name, "no search query in generation; using step action");
            call.action.trim().to_string()
        });

        let response = self.search.search(&search_query, call.deadline)?;
        if response.results.is_empty() {
            warn!(capability = %self.name, %search_query, "search returned no results");
            return Ok(CapabilityOutput {
                message: Message::failed(
                    &self.name,
                    format!("Search for \"{search_query}\" returned no results."),
                ),
                traces: Vec::new(),
            });
        }

        info!(capability = %self.name, sources = response.results.len(), "search completed");
        let traces = vec![json!({
            "search_query": search_query,
            "sources": response.results,
        })];
        Ok(CapabilityOutput {
            message: Message::completed(&self.name, with_trace_line(&render(&response), &traces)),
            traces,
        })
    }
}

fn proposed_query(text: &str) -> Option<String> {
    extract_first_json_object(&strip_thinking(text))
        .ok()?
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .map(str::to_string)
}

fn render(response: &SearchResponse) -> String {
    let mut out = String::new();
    if let Some(answer) = &response.answer {
        out.push_str(answer.trim());
        out.push_str("\n\n");
    }
    out.push_str("Sources:");
    for (index, source) in response.results.iter().enumerate() {
        let title = if source.title.trim().is_empty() {
            source.url.as_str()
        } else {
            source.title.trim()
        };
        out.push_str(&format!("\n{}. {title} <{}>", index + 1, source.url));
        if let Some(snippet) = &source.snippet {
            out.push_str(&format!("\n   {}", snippet.trim()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use analyst_center_domain::{
        extract_trailing_payload, Deadline, MessageStatus, SearchResponse, SearchSource,
        EXECUTION_TRACE_MARKER,
    };
    use analyst_center_provider::{ScriptedGenerator, StaticSearchService};
    use serde_json::json;

    use super::SearchCapability;
    use crate::CapabilityCall;

    fn call<'c>(deadline: &'c Deadline) -> CapabilityCall<'c> {
        CapabilityCall {
            user_query: "What changed in the latest SQLite release?",
            action: "latest sqlite release notes",
            instruction: "User request: What changed in the latest SQLite release?",
            history: &[],
            model_id: "fast",
            deadline,
        }
    }

    #[test]
    fn sources_are_numbered_and_traced() {
        let generator = ScriptedGenerator::new([r#"{"query": "sqlite release notes 2026"}"#]);
        let service = StaticSearchService::new(SearchResponse {
            answer: Some("SQLite 3.50 added JSONB helpers.".to_string()),
            results: vec![SearchSource {
                title: "Release History".to_string(),
                url: "https://sqlite.example/releaselog".to_string(),
                snippet: Some("3.50.0 adds...".to_string()),
            }],
        });
        let capability = SearchCapability::new("web", &generator, &service);
        let deadline = Deadline::none();

        let output = capability.invoke(&call(&deadline)).unwrap_or_else(|_| unreachable!());
        assert_eq!(output.message.status, MessageStatus::Completed);
        assert!(output
            .message
            .content
            .contains("1. Release History <https://sqlite.example/releaselog>"));
        assert_eq!(service.queries(), vec!["sqlite release notes 2026".to_string()]);

        let trace = extract_trailing_payload(&output.message.content, EXECUTION_TRACE_MARKER)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(trace[0]["search_query"], json!("sqlite release notes 2026"));
        assert_eq!(trace[0]["sources"][0]["url"], json!("https://sqlite.example/releaselog"));
    }

    #[test]
    fn unusable_generation_falls_back_to_step_action() {
        let generator = ScriptedGenerator::new(["search for it yourself"]);
        let service = StaticSearchService::new(SearchResponse::default());
        let capability = SearchCapability::new("web", &generator, &service);
        let deadline = Deadline::none();

        let output = capability.invoke(&call(&deadline)).unwrap_or_else(|_| unreachable!());
        assert_eq!(service.queries(), vec!["latest sqlite release notes".to_string()]);
        assert_eq!(output.message.status, MessageStatus::Failed);
        assert!(output.traces.is_empty());
    }
}
