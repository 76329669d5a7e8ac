use analyst_center_domain::{strip_thinking, Message, OrchestratorError};
use analyst_center_provider::{GenerationRequest, TextGenerator};
use tracing::{info, warn};

use crate::{render_history, CapabilityCall, CapabilityOutput};

const SYSTEM_PROMPT: &str = "You are a data analyst writing the final answer for the user. \
Ground every statement in the conversation. Cite query results and numbered sources where \
they support a claim.";

pub struct SummarizationCapability<'a> {
    pub(crate) name: String,
    generator: &'a dyn TextGenerator,
}

impl<'a> SummarizationCapability<'a> {
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
            "Original question: {}\n\n{}\n\nConversation so far:\n{}\n\nWrite the answer now.",
            call.user_query,
            call.instruction,
            render_history(call.history)
        );
        let request = GenerationRequest::new(call.model_id, SYSTEM_PROMPT, prompt);
        let generation = self.generator.generate(&request, call.deadline)?;
        let answer = strip_thinking(&generation.text);

        let message = if answer.is_empty() {
            warn!(capability = %self.name, "summarization produced no text");
            Message::failed(&self.name, "Summarization produced no answer.".to_string())
        } else {
            info!(capability = %self.name, chars = answer.chars().count(), "answer written");
            Message::completed(&self.name, answer)
        };
        Ok(CapabilityOutput {
            message,
            traces: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use analyst_center_domain::{Deadline, Message, MessageStatus};
    use analyst_center_provider::ScriptedGenerator;

    use super::SummarizationCapability;
    use crate::CapabilityCall;

    #[test]
    fn answer_is_emitted_without_reasoning_markup() {
        let generator =
            ScriptedGenerator::new(["<think>check the totals</think>\nEMEA leads with 150."]);
        let capability = SummarizationCapability::new("writer", &generator);
        let deadline = Deadline::none();
        let history = vec![Message::completed(
            "sql",
            "Query returned 2 row(s).\n\nEXECUTION_TRACE: [{\"row_count\": 2}]".to_string(),
        )];
        let call = CapabilityCall {
            user_query: "Which region leads?",
            action: "Summarize",
            instruction: "User request: Which region leads?",
            history: &history,
            model_id: "writer-model",
            deadline: &deadline,
        };

        let output = capability.invoke(&call).unwrap_or_else(|_| unreachable!());
        assert_eq!(output.message.status, MessageStatus::Completed);
        assert_eq!(output.message.content, "EMEA leads with 150.");

        let requests = generator.requests();
        assert_eq!(requests[0].model_id, "writer-model");
        assert!(requests[0].prompt.contains("Query returned 2 row(s)."));
        assert!(!requests[0].prompt.contains("EXECUTION_TRACE"));
    }

    #[test]
    fn blank_answer_is_a_failure() {
        let generator = ScriptedGenerator::new(["<think>nothing to say"]);
        let capability = SummarizationCapability::new("writer", &generator);
        let deadline = Deadline::none();
        let call = CapabilityCall {
            user_query: "q",
            action: "a",
            instruction: "i",
            history: &[],
            model_id: "m",
            deadline: &deadline,
        };
        let output = capability.invoke(&call).unwrap_or_else(|_| unreachable!());
        assert_eq!(output.message.status, MessageStatus::Failed);
    }
}
