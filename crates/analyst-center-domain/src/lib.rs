#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod extract;

pub use extract::{
    extract_first_json_object, extract_json_after_marker, extract_trailing_payload,
    strip_thinking, strip_trailing_payloads, JsonExtractError,
};

pub type DateTimeUtc = OffsetDateTime;

/// Marker preceding trace payloads inlined in capability messages.
pub const EXECUTION_TRACE_MARKER: &str = "EXECUTION_TRACE:";
/// Marker preceding visualization specifications.
pub const CHART_SPEC_MARKER: &str = "CHART_SPEC:";
/// Author tag of messages appended by the planner. Reserved.
pub const PLANNER_TAG: &str = "planner";

pub const DEFAULT_MAX_REPLANS: u32 = 2;
pub const DEFAULT_ROW_CAP: u64 = 10_000;
pub const MAX_SAMPLE_ROWS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique key for a visualization spec, used for client-side keying.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChartId(pub Ulid);

impl ChartId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChartId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Completed,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Message {
    pub content: String,
    pub author: String,
    pub status: MessageStatus,
}

impl Message {
    #[must_use]
    pub fn completed(author: &str, content: String) -> Self {
        Self {
            content,
            author: author.to_string(),
            status: MessageStatus::Completed,
        }
    }

    #[must_use]
    pub fn failed(author: &str, content: String) -> Self {
        Self {
            content,
            author: author.to_string(),
            status: MessageStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Step {
    #[serde(rename = "agent", alias = "capability")]
    pub capability: String,
    pub action: String,
}

/// Ordered steps keyed by their 1-based index. Indices are always contiguous.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Plan {
    steps: BTreeMap<usize, Step>,
}

impl Plan {
    #[must_use]
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps: steps
                .into_iter()
                .enumerate()
                .map(|(offset, step)| (offset + 1, step))
                .collect(),
        }
    }

    /// Build a plan from an explicit index mapping.
    ///
    /// # Errors
    /// Returns `PlanParse` when the indices are not exactly `1..=N`.
    pub fn from_indexed(steps: BTreeMap<usize, Step>) -> Result<Self, OrchestratorError> {
        for (expected, index) in (1..).zip(steps.keys()) {
            if *index != expected {
                return Err(OrchestratorError::PlanParse(format!(
                    "plan step indices must be contiguous from 1; expected {expected}, found {index}"
                )));
            }
        }
        Ok(Self { steps })
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(&index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Step)> {
        self.steps.iter().map(|(index, step)| (*index, step))
    }
}

/// Per-request mutable state. Owned by exactly one in-flight request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestState {
    pub run_id: RunId,
    pub user_query: String,
    pub enabled_capabilities: Vec<String>,
    pub plan: Plan,
    pub current_step: usize,
    pub replan_count: u32,
    pub replan_requested: bool,
    pub replanning_disabled: bool,
    history: Vec<Message>,
    pub model_usage: BTreeMap<String, String>,
    pub final_answer: Option<String>,
    pub formatted_response: Option<Value>,
}

impl RequestState {
    #[must_use]
    pub fn new(run_id: RunId, user_query: &str, enabled_capabilities: Vec<String>) -> Self {
        Self {
            run_id,
            user_query: user_query.to_string(),
            enabled_capabilities,
            plan: Plan::default(),
            current_step: 0,
            replan_count: 0,
            replan_requested: false,
            replanning_disabled: false,
            history: Vec::new(),
            model_usage: BTreeMap::new(),
            final_answer: None,
            formatted_response: None,
        }
    }

    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn append_message(&mut self, message: Message) {
        self.history.push(message);
    }

    #[must_use]
    pub fn latest_message(&self) -> Option<&Message> {
        self.history.last()
    }

    #[must_use]
    pub fn current_step_definition(&self) -> Option<&Step> {
        self.plan.get(self.current_step)
    }

    #[must_use]
    pub fn is_replanning(&self) -> bool {
        self.replan_count > 0
    }

    #[must_use]
    pub fn is_enabled(&self, capability: &str) -> bool {
        self.enabled_capabilities
            .iter()
            .any(|name| name == capability)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchSource {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchResponse {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanningTrace {
    pub plan: Value,
    pub reasoning_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryTraceEntry {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub row_count: usize,
    #[serde(default)]
    pub sample_data: Vec<Value>,
    #[serde(default)]
    pub stats: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchTraceEntry {
    pub search_query: String,
    #[serde(default)]
    pub sources: Vec<SearchSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceDetail {
    Planning(PlanningTrace),
    Query(QueryTraceEntry),
    Search(SearchTraceEntry),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTraceRecord {
    pub step: usize,
    pub agent: String,
    #[serde(flatten)]
    pub detail: TraceDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualizationSpec {
    pub id: ChartId,
    pub agent: String,
    pub spec: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunMetadata {
    pub models_used: BTreeMap<String, String>,
    pub step_count: usize,
    pub replan_count: u32,
}

/// Outward contract returned by `Orchestrator::run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResponse {
    pub run_id: RunId,
    pub answer: String,
    pub visualization_specs: Vec<VisualizationSpec>,
    pub trace_records: Vec<ExecutionTraceRecord>,
    pub metadata: RunMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Query,
    Search,
    Visualization,
    Summarization,
}

impl CapabilityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Search => "search",
            Self::Visualization => "visualization",
            Self::Summarization => "summarization",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "query" => Some(Self::Query),
            "search" => Some(Self::Search),
            "visualization" => Some(Self::Visualization),
            "summarization" => Some(Self::Summarization),
            _ => None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_generation_timeout_ms() -> u64 {
    60_000
}

fn default_search_timeout_ms() -> u64 {
    20_000
}

fn default_search_max_results() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CapabilityDefinition {
    pub name: String,
    pub kind: CapabilityKind,
    pub description: String,
    pub model_id: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenerationEndpoint {
    pub url: String,
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SearchEndpoint {
    pub url: String,
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default = "default_search_max_results")]
    pub max_results: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlannerSettings {
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunLimits {
    #[serde(default = "RunLimits::default_max_replans")]
    pub max_replans: u32,
    #[serde(default = "RunLimits::default_row_cap")]
    pub row_cap: u64,
    #[serde(default = "RunLimits::default_sample_rows")]
    pub sample_rows: usize,
    #[serde(default = "RunLimits::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl RunLimits {
    fn default_max_replans() -> u32 {
        DEFAULT_MAX_REPLANS
    }

    fn default_row_cap() -> u64 {
        DEFAULT_ROW_CAP
    }

    fn default_sample_rows() -> usize {
        MAX_SAMPLE_ROWS
    }

    fn default_request_timeout_ms() -> u64 {
        120_000
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_replans: Self::default_max_replans(),
            row_cap: Self::default_row_cap(),
            sample_rows: Self::default_sample_rows(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReplanPolicyKind {
    #[default]
    OnFailure,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnalystConfig {
    pub config_name: String,
    pub config_version: String,
    #[serde(default)]
    pub normalization_version: u32,
    pub generation: GenerationEndpoint,
    #[serde(default)]
    pub search: Option<SearchEndpoint>,
    pub planner: PlannerSettings,
    pub capabilities: Vec<CapabilityDefinition>,
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub replan_policy: ReplanPolicyKind,
}

impl AnalystConfig {
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<&CapabilityDefinition> {
        self.capabilities
            .iter()
            .find(|capability| capability.name == name)
    }

    #[must_use]
    pub fn capability_names(&self) -> BTreeSet<&str> {
        self.capabilities
            .iter()
            .map(|capability| capability.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedConfigEnvelope {
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub config: AnalystConfig,
    pub normalized_json: Value,
}

/// Per-request overrides applied on top of the injected configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunOverrides {
    #[serde(default)]
    pub planner_model: Option<String>,
    #[serde(default)]
    pub capability_models: BTreeMap<String, String>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Request-scoped deadline shared by every external call of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    #[must_use]
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(budget),
        }
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }

    /// Remaining budget, or `None` when the request is unbounded.
    ///
    /// # Errors
    /// Returns `Timeout` naming `stage` when the deadline has already passed.
    pub fn remaining(&self, stage: &str) -> Result<Option<Duration>, OrchestratorError> {
        match self.expires_at {
            None => Ok(None),
            Some(expires_at) => {
                let now = Instant::now();
                if now >= expires_at {
                    Err(OrchestratorError::Timeout(stage.to_string()))
                } else {
                    Ok(Some(expires_at - now))
                }
            }
        }
    }

    /// Clamp a collaborator timeout to the remaining request budget.
    ///
    /// # Errors
    /// Returns `Timeout` when the deadline has already passed.
    pub fn clamp(&self, stage: &str, timeout: Duration) -> Result<Duration, OrchestratorError> {
        Ok(self
            .remaining(stage)?
            .map_or(timeout, |remaining| remaining.min(timeout)))
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OrchestratorError {
    #[error("plan parse error: {0}")]
    PlanParse(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("deadline exceeded during {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl OrchestratorError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PlanParse(_) => "plan_parse_error",
            Self::Transport(_) => "transport_error",
            Self::Timeout(_) => "timeout",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Caller-facing text. Transport detail stays in server-side logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::PlanParse(_) => "the planner returned a plan that could not be parsed".to_string(),
            Self::Transport(_) => "an upstream service request failed".to_string(),
            Self::Timeout(_) => "the request deadline was exceeded".to_string(),
            Self::Configuration(detail) => format!("invalid request: {detail}"),
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Truncate on a char boundary, appending an ellipsis when shortened.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}…", &value[..byte_index]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Deadline, ExecutionTraceRecord, OrchestratorError, Plan, PlanningTrace, Step,
        TraceDetail,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn step(capability: &str) -> Step {
        Step {
            capability: capability.to_string(),
            action: format!("run {capability}"),
        }
    }

    #[test]
    fn plan_rejects_gaps_in_step_indices() {
        let mut steps = BTreeMap::new();
        steps.insert(1, step("sql"));
        steps.insert(3, step("search"));
        let result = Plan::from_indexed(steps);
        assert!(matches!(result, Err(OrchestratorError::PlanParse(_))));
    }

    #[test]
    fn plan_serializes_as_index_keyed_object() {
        let plan = Plan::from_steps(vec![step("search"), step("summarize")]);
        let value = serde_json::to_value(&plan);
        assert!(value.is_ok());
        let value = value.unwrap_or_else(|_| unreachable!());
        assert_eq!(value["1"]["agent"], "search");
        assert_eq!(value["2"]["agent"], "summarize");

        let back: Result<Plan, _> = serde_json::from_value(value);
        assert!(back.is_ok());
        assert_eq!(back.unwrap_or_else(|_| unreachable!()), plan);
    }

    #[test]
    fn trace_record_flattens_type_tag() {
        let record = ExecutionTraceRecord {
            step: 1,
            agent: "planner".to_string(),
            detail: TraceDetail::Planning(PlanningTrace {
                plan: json!({"1": {"agent": "sql", "action": "count"}}),
                reasoning_model: "reasoner-1".to_string(),
            }),
        };
        let value = serde_json::to_value(&record);
        assert!(value.is_ok());
        let value = value.unwrap_or_else(|_| unreachable!());
        assert_eq!(value["type"], "planning");
        assert_eq!(value["reasoning_model"], "reasoner-1");
        assert_eq!(value["step"], 1);
    }

    #[test]
    fn expired_deadline_reports_timeout_stage() {
        let deadline = Deadline::after(Duration::ZERO);
        let result = deadline.remaining("planner");
        assert_eq!(
            result,
            Err(OrchestratorError::Timeout("planner".to_string()))
        );
        assert!(Deadline::none().remaining("planner").is_ok());
    }

    #[test]
    fn transport_detail_is_not_exposed_publicly() {
        let err = OrchestratorError::Transport("POST https://internal:9000 refused".to_string());
        assert!(!err.public_message().contains("internal"));
        assert_eq!(err.code(), "transport_error");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(super::truncate_chars("héllo", 2), "hé…");
        assert_eq!(super::truncate_chars("abc", 5), "abc");
    }
}
