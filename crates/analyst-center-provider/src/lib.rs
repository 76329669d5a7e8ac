#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use analyst_center_domain::{Deadline, OrchestratorError, SearchResponse};
use serde::Serialize;

mod http;

pub use http::{HttpJsonGenerator, HttpSearchService};

/// One text-generation call against a named model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub model_id: String,
    pub system: String,
    pub prompt: String,
    /// Ask the endpoint for a JSON object response when it supports one.
    pub json_response: bool,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    #[must_use]
    pub fn new(model_id: &str, system: &str, prompt: String) -> Self {
        Self {
            model_id: model_id.to_string(),
            system: system.to_string(),
            prompt,
            json_response: false,
            temperature: None,
        }
    }

    #[must_use]
    pub fn expecting_json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub model_id: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub latency_ms: u64,
}

pub trait TextGenerator: Send + Sync {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn generate(
        &self,
        request: &GenerationRequest,
        deadline: &Deadline,
    ) -> Result<Generation, OrchestratorError>;
}

pub trait SearchService: Send + Sync {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn search(&self, query: &str, deadline: &Deadline) -> Result<SearchResponse, OrchestratorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    Error(OrchestratorError),
}

/// Generator that replays a fixed queue of replies in call order.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    #[must_use]
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_replies(
            replies
                .into_iter()
                .map(|reply| ScriptedReply::Text(reply.into())),
        )
    }

    #[must_use]
    pub fn with_replies(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        deadline: &Deadline,
    ) -> Result<Generation, OrchestratorError> {
        deadline.remaining("model generation")?;
        lock(&self.requests).push(request.clone());
        match lock(&self.replies).pop_front() {
            Some(ScriptedReply::Text(text)) => Ok(Generation {
                text,
                model_id: request.model_id.clone(),
                input_tokens: None,
                output_tokens: None,
                latency_ms: 0,
            }),
            Some(ScriptedReply::Error(err)) => Err(err),
            None => Err(OrchestratorError::Transport(format!(
                "scripted generator has no reply for model {}",
                request.model_id
            ))),
        }
    }
}

/// Search service returning one canned response for every query.
#[derive(Debug, Default)]
pub struct StaticSearchService {
    response: SearchResponse,
    queries: Mutex<Vec<String>>,
}

impl StaticSearchService {
    #[must_use]
    pub fn new(response: SearchResponse) -> Self {
        Self {
            response,
            queries: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

impl SearchService for StaticSearchService {
    fn provider_name(&self) -> &'static str {
        "static"
    }

    fn search(&self, query: &str, deadline: &Deadline) -> Result<SearchResponse, OrchestratorError> {
        deadline.remaining("web search")?;
        lock(&self.queries).push(query.to_string());
        Ok(self.response.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
