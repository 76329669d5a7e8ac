use analyst_center_domain::{
    extract_first_json_object, strip_thinking, truncate_chars, Message, OrchestratorError,
};
use analyst_center_provider::{GenerationRequest, TextGenerator};
use analyst_center_sql_guard::{DataStore, GuardOutcome, QueryExecution, SqlGuard};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::{render_history, with_trace_line, CapabilityCall, CapabilityOutput};

const PREVIEW_ROWS: usize = 20;
const PREVIEW_CELL_CHARS: usize = 80;

const SYSTEM_PROMPT: &str = "You translate analytical questions into a single read-only SQLite \
query. Respond with one JSON object: {\"sql\": \"SELECT ...\", \"params\": [...]}. Use `?` \
placeholders for literal values and list them in `params`. Only SELECT or WITH ... SELECT \
statements are executed.";

/// Natural language to guarded SQL, with bounded self-correction.
pub struct QueryCapability<'a> {
    pub(crate) name: String,
    generator: &'a dyn TextGenerator,
    store: &'a dyn DataStore,
    guard: SqlGuard,
    max_attempts: u32,
    sample_rows: usize,
}

#[derive(Debug)]
struct ProposedQuery {
    sql: String,
    params: Vec<Value>,
}

impl<'a> QueryCapability<'a> {
    #[must_use]
    pub fn new(
        name: &str,
        generator: &'a dyn TextGenerator,
        store: &'a dyn DataStore,
        guard: SqlGuard,
        max_attempts: u32,
        sample_rows: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            generator,
            store,
            guard,
            max_attempts: max_attempts.max(1),
            sample_rows,
        }
    }

    pub(crate) fn invoke(
        &self,
        call: &CapabilityCall<'_>,
    ) -> Result<CapabilityOutput, OrchestratorError> {
        let schema = self
            .store
            .describe_schema(&self.guard, call.deadline)
            .map_err(|err| err.into_orchestrator_error("schema lookup"))?;
        let history = render_history(call.history);

        let mut feedback: Option<String> = None;
        for attempt in 1..=self.max_attempts {
            let prompt = build_prompt(call.instruction, &schema, &history, feedback.as_deref());
            let request = GenerationRequest::new(call.model_id, SYSTEM_PROMPT, prompt).expecting_json();
            let generation = self.generator.generate(&request, call.deadline)?;

            let proposed = match parse_proposed_query(&generation.text) {
                Ok(proposed) => proposed,
                Err(problem) => {
                    warn!(capability = %self.name, attempt, %problem, "query proposal unusable");
                    feedback = Some(problem);
                    continue;
                }
            };

            match self
                .guard
                .execute(self.store, &proposed.sql, &proposed.params, call.deadline)?
            {
                GuardOutcome::Executed(execution) => {
                    info!(
                        capability = %self.name,
                        attempt,
                        rows = execution.rows.rows.len(),
                        "query executed"
                    );
                    return Ok(self.success(&execution, attempt));
                }
                GuardOutcome::Rejected(rejection) => {
                    debug!(capability = %self.name, attempt, kind = rejection.kind.as_str(), "feeding rejection back to generator");
                    feedback = Some(format!(
                        "The previous query `{}` was rejected ({}): {}",
                        proposed.sql,
                        rejection.kind.as_str(),
                        rejection.message
                    ));
                }
            }
        }

        let last_error = feedback.unwrap_or_default();
        warn!(capability = %self.name, attempts = self.max_attempts, "query attempts exhausted");
        Ok(CapabilityOutput {
            message: Message::failed(
                &self.name,
                format!(
                    "Could not produce a valid query after {} attempt(s). Last error: {last_error}",
                    self.max_attempts
                ),
            ),
            traces: Vec::new(),
        })
    }

    fn success(&self, execution: &QueryExecution, attempts: u32) -> CapabilityOutput {
        let rows = &execution.rows;
        let sample_data: Vec<Value> = rows
            .rows
            .iter()
            .take(self.sample_rows)
            .cloned()
            .map(Value::Object)
            .collect();
        let trace = json!({
            "sql": execution.query.sql(),
            "params": execution.params,
            "row_count": rows.rows.len(),
            "sample_data": sample_data,
            "stats": {
                "columns": rows.columns,
                "elapsed_ms": rows.elapsed_ms,
                "limit_injected": execution.query.limit_injected(),
                "truncated": rows.truncated,
                "attempts": attempts,
            },
        });

        let mut prose = format!("Query returned {} row(s)", rows.rows.len());
        if rows.truncated {
            prose.push_str(&format!(" (truncated at {})", execution.query.row_cap()));
        }
        prose.push_str(".\n\n");
        prose.push_str(&render_preview(&rows.columns, &rows.rows));

        let traces = vec![trace];
        CapabilityOutput {
            message: Message::completed(&self.name, with_trace_line(&prose, &traces)),
            traces,
        }
    }
}

fn build_prompt(instruction: &str, schema: &str, history: &str, feedback: Option<&str>) -> String {
    let mut prompt = format!(
        "{instruction}\n\nDatabase schema:\n{schema}\n\nConversation so far:\n{history}"
    );
    if let Some(feedback) = feedback {
        prompt.push_str("\n\nCorrection needed: ");
        prompt.push_str(feedback);
        prompt.push_str("\nReturn a corrected JSON object.");
    }
    prompt
}

fn parse_proposed_query(text: &str) -> Result<ProposedQuery, String> {
    let value = extract_first_json_object(&strip_thinking(text))
        .map_err(|err| format!("the response did not contain a JSON object ({err})"))?;
    let sql = value
        .get("sql")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|sql| !sql.is_empty())
        .ok_or_else(|| "the JSON object has no non-empty `sql` string".to_string())?;
    let params = match value.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err("`params` must be an array".to_string()),
    };
    Ok(ProposedQuery {
        sql: sql.to_string(),
        params,
    })
}

fn render_preview(columns: &[String], rows: &[Map<String, Value>]) -> String {
    if columns.is_empty() {
        return "(no columns)".to_string();
    }
    let mut out = format!("| {} |\n|{}|", columns.join(" | "), "---|".repeat(columns.len()));
    for row in rows.iter().take(PREVIEW_ROWS) {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| match row.get(column) {
                Some(Value::String(text)) => truncate_chars(text, PREVIEW_CELL_CHARS),
                Some(Value::Null) | None => String::new(),
                Some(other) => truncate_chars(&other.to_string(), PREVIEW_CELL_CHARS),
            })
            .collect();
        out.push_str(&format!("\n| {} |", cells.join(" | ")));
    }
    if rows.len() > PREVIEW_ROWS {
        out.push_str(&format!("\n... {} more row(s)", rows.len() - PREVIEW_ROWS));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use analyst_center_domain::{
        extract_trailing_payload, Deadline, MessageStatus, EXECUTION_TRACE_MARKER,
    };
    use analyst_center_provider::ScriptedGenerator;
    use analyst_center_sql_guard::{SqlGuard, SqliteDataStore};
    use rusqlite::Connection;
    use serde_json::json;

    use super::{parse_proposed_query, QueryCapability};
    use crate::CapabilityCall;

    fn seeded_db() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "analyst-center-capability-query-{}.sqlite3",
            ulid::Ulid::new()
        ));
        let conn = Connection::open(&path).unwrap_or_else(|_| unreachable!());
        let seeded = conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, region TEXT, total REAL);
             INSERT INTO orders (region, total) VALUES ('emea', 120.0), ('apac', 80.0), ('emea', 30.0);",
        );
        assert!(seeded.is_ok());
        path
    }

    fn call<'c>(deadline: &'c Deadline) -> CapabilityCall<'c> {
        CapabilityCall {
            user_query: "Total order value by region?",
            action: "Sum order totals grouped by region",
            instruction: "User request: Total order value by region?",
            history: &[],
            model_id: "coder",
            deadline,
        }
    }

    #[test]
    fn rejected_sql_is_fed_back_and_corrected() {
        let path = seeded_db();
        let store = SqliteDataStore::new(&path);
        let generator = ScriptedGenerator::new([
            r#"{"sql": "DELETE FROM orders"}"#,
            r#"<think>use a group by</think>{"sql": "SELECT region, SUM(total) AS total FROM orders WHERE total > ? GROUP BY region ORDER BY region", "params": [10]}"#,
        ]);
        let capability =
            QueryCapability::new("sql", &generator, &store, SqlGuard::default(), 3, 10);

        let deadline = Deadline::none();
        let output = capability.invoke(&call(&deadline));
        assert!(output.is_ok());
        let output = output.unwrap_or_else(|_| unreachable!());

        assert_eq!(output.message.author, "sql");
        assert_eq!(output.message.status, MessageStatus::Completed);
        assert!(output.message.content.starts_with("Query returned 2 row(s)."));

        let requests = generator.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].prompt.contains("not_read_only"));
        assert!(requests[0].prompt.contains("CREATE TABLE orders"));

        let trace = extract_trailing_payload(&output.message.content, EXECUTION_TRACE_MARKER)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(trace[0]["row_count"], json!(2));
        assert_eq!(trace[0]["params"], json!([10]));
        assert_eq!(trace[0]["stats"]["attempts"], json!(2));
        assert_eq!(trace[0]["sample_data"][0]["region"], json!("apac"));
        assert_eq!(output.traces.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn exhausted_attempts_produce_a_failed_message() {
        let path = seeded_db();
        let store = SqliteDataStore::new(&path);
        let generator = ScriptedGenerator::new([
            "I cannot write SQL today.",
            r#"{"sql": "SELECT * FROM missing_table"}"#,
        ]);
        let capability =
            QueryCapability::new("sql", &generator, &store, SqlGuard::default(), 2, 10);

        let deadline = Deadline::none();
        let output = capability.invoke(&call(&deadline));
        assert!(output.is_ok());
        let output = output.unwrap_or_else(|_| unreachable!());
        assert_eq!(output.message.status, MessageStatus::Failed);
        assert!(output.message.content.contains("missing_table"));
        assert!(output.traces.is_empty());
        assert!(!output.message.content.contains(EXECUTION_TRACE_MARKER));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn proposal_requires_sql_string_and_array_params() {
        assert!(parse_proposed_query(r#"{"sql": "  "}"#).is_err());
        assert!(parse_proposed_query(r#"{"sql": "SELECT 1", "params": "x"}"#).is_err());
        let proposed = parse_proposed_query("```json\n{\"sql\": \"SELECT 1\"}\n```");
        assert!(proposed.is_ok());
        assert!(proposed.unwrap_or_else(|_| unreachable!()).params.is_empty());
    }
}
