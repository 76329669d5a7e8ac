use analyst_center_domain::{
    extract_first_json_object, strip_thinking, Message, OrchestratorError, CHART_SPEC_MARKER,
};
use analyst_center_provider::{GenerationRequest, TextGenerator};
use serde_json::Value;
use tracing::{info, warn};

use crate::{render_history, CapabilityCall, CapabilityOutput};

const SYSTEM_PROMPT: &str = "You design charts. Respond with exactly one Vega-Lite \
specification as a JSON object with inline `data.values` taken from the conversation.";

pub struct VisualizationCapability<'a> {
    pub(crate) name: String,
    generator: &'a dyn TextGenerator,
}

impl<'a> VisualizationCapability<'a> {
    #[must_use]
    pub fn new(name: &str, generator: &'a dyn TextGenerator) -> Self {
        Self {
            name: name.to_string(),
            generator,
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

        let spec = match extract_first_json_object(&strip_thinking(&generation.text)) {
            Ok(Value::Object(spec)) if !spec.is_empty() => Value::Object(spec),
            Ok(_) | Err(_) => {
                warn!(capability = %self.name, "generation contained no chart specification");
                return Ok(CapabilityOutput {
                    message: Message::failed(
                        &self.name,
                        "Could not produce a chart specification.".to_string(),
                    ),
                    traces: Vec::new(),
                });
            }
        };

        let title = spec
            .get("title")
            .and_then(|title| title.as_str().or_else(|| title.get("text")?.as_str()))
            .unwrap_or("untitled");
        info!(capability = %self.name, %title, "chart specification prepared");
        Ok(CapabilityOutput {
            message: Message::completed(
                &self.name,
                format!("Prepared chart: {title}\n\n{CHART_SPEC_MARKER} {spec}"),
            ),
            traces: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use analyst_center_domain::{
        extract_trailing_payload, Deadline, Message, MessageStatus, CHART_SPEC_MARKER,
    };
    use analyst_center_provider::ScriptedGenerator;
    use serde_json::json;

    use super::VisualizationCapability;
    use crate::CapabilityCall;

    fn invoke(reply: &str) -> analyst_center_domain::Message {
        let generator = ScriptedGenerator::new([reply]);
        let capability = VisualizationCapability::new("chart", &generator);
        let deadline = Deadline::none();
        let history = vec![Message::completed("sql", "| region | total |".to_string())];
        let call = CapabilityCall {
            user_query: "Chart sales by region",
            action: "Bar chart of totals",
            instruction: "User request: Chart sales by region",
            history: &history,
            model_id: "viz",
            deadline: &deadline,
        };
        capability
            .invoke(&call)
            .unwrap_or_else(|_| unreachable!())
            .message
    }

    #[test]
    fn spec_is_embedded_after_marker() {
        let message = invoke(
            r#"Here you go: {"title": {"text": "Totals"}, "mark": "bar", "data": {"values": [{"region": "emea", "total": 150}]}}"#,
        );
        assert_eq!(message.status, MessageStatus::Completed);
        assert!(message.content.starts_with("Prepared chart: Totals"));
        let spec = extract_trailing_payload(&message.content, CHART_SPEC_MARKER);
        assert_eq!(
            spec.map(|spec| spec["mark"].clone()),
            Ok(json!("bar"))
        );
    }

    #[test]
    fn marker_in_title_does_not_shadow_the_embedded_spec() {
        let message = invoke(
            r#"{"title": "CHART_SPEC: {\"mark\": \"point\"}", "mark": "bar"}"#,
        );
        assert_eq!(message.status, MessageStatus::Completed);
        let spec = extract_trailing_payload(&message.content, CHART_SPEC_MARKER);
        assert_eq!(
            spec.map(|spec| spec["mark"].clone()),
            Ok(json!("bar"))
        );
    }

    #[test]
    fn missing_spec_is_a_failed_message() {
        let message = invoke("Charts are not possible for this data.");
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(!message.content.contains(CHART_SPEC_MARKER));
    }
}
