use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use analyst_center_domain::{
    truncate_chars, Deadline, GenerationEndpoint, OrchestratorError, SearchEndpoint,
    SearchResponse, SearchSource,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Generation, GenerationRequest, SearchService, TextGenerator};

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
struct HttpEndpointConfig {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpEndpointConfig {
    fn resolve(
        url: &str,
        timeout_ms: u64,
        headers: &BTreeMap<String, String>,
        auth_bearer_env: Option<&str>,
    ) -> Result<Self, OrchestratorError> {
        if url.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "http endpoint requires a url".to_string(),
            ));
        }

        let auth_bearer_token = match auth_bearer_env {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                OrchestratorError::Configuration(format!(
                    "missing env var '{env_name}' required by auth_bearer_env"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            url: url.to_string(),
            timeout_ms,
            headers: headers.clone(),
            auth_bearer_token,
        })
    }

    /// POST `body` and return the decoded JSON response.
    fn post_json(
        &self,
        stage: &str,
        body: &Value,
        deadline: &Deadline,
    ) -> Result<Value, OrchestratorError> {
        let timeout = deadline.clamp(stage, Duration::from_millis(self.timeout_ms))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();

        let mut req = agent
            .request("POST", &self.url)
            .set("content-type", "application/json");
        for (header, value) in &self.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(body) {
            Ok(response) => response.into_json::<Value>().map_err(|err| {
                OrchestratorError::Transport(format!("{stage} returned an unreadable body: {err}"))
            }),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                warn!(stage, status = code, "http endpoint returned error status");
                Err(OrchestratorError::Transport(format!(
                    "{stage} returned http status {code}: {}",
                    truncate_chars(&body, ERROR_BODY_PREVIEW_CHARS)
                )))
            }
            Err(ureq::Error::Transport(err)) => {
                if deadline.is_expired() {
                    Err(OrchestratorError::Timeout(stage.to_string()))
                } else {
                    Err(OrchestratorError::Transport(format!(
                        "{stage} transport failure: {err}"
                    )))
                }
            }
        }
    }
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct HttpJsonGenerator {
    config: HttpEndpointConfig,
    default_temperature: Option<f32>,
}

impl HttpJsonGenerator {
    /// Resolve endpoint settings, including the bearer token environment variable.
    ///
    /// # Errors
    /// Returns `Configuration` when the url is empty or the token variable is unset.
    pub fn from_endpoint(endpoint: &GenerationEndpoint) -> Result<Self, OrchestratorError> {
        Ok(Self {
            config: HttpEndpointConfig::resolve(
                &endpoint.url,
                endpoint.timeout_ms,
                &endpoint.headers,
                endpoint.auth_bearer_env.as_deref(),
            )?,
            default_temperature: endpoint.temperature,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": request.model_id,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });
        if let Some(temperature) = request.temperature.or(self.default_temperature) {
            body["temperature"] = json!(temperature);
        }
        if request.json_response {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

impl TextGenerator for HttpJsonGenerator {
    fn provider_name(&self) -> &'static str {
        "http_json"
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        deadline: &Deadline,
    ) -> Result<Generation, OrchestratorError> {
        let started = Instant::now();
        let response = self
            .config
            .post_json("model generation", &self.request_body(request), deadline)?;
        let generation = parse_chat_completion(&response, &request.model_id, started)?;
        debug!(
            model_id = %generation.model_id,
            latency_ms = generation.latency_ms,
            output_tokens = generation.output_tokens,
            "generation completed"
        );
        Ok(generation)
    }
}

fn parse_chat_completion(
    response: &Value,
    requested_model: &str,
    started: Instant,
) -> Result<Generation, OrchestratorError> {
    let text = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            OrchestratorError::Transport(
                "model generation response has no choices[0].message.content".to_string(),
            )
        })?;

    Ok(Generation {
        text: text.to_string(),
        model_id: response
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string(),
        input_tokens: response.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
        output_tokens: response
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64),
        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// Web search client speaking the Tavily-style `{query, max_results}` protocol.
#[derive(Debug, Clone)]
pub struct HttpSearchService {
    config: HttpEndpointConfig,
    max_results: u32,
}

impl HttpSearchService {
    /// # Errors
    /// Returns `Configuration` when the url is empty or the token variable is unset.
    pub fn from_endpoint(endpoint: &SearchEndpoint) -> Result<Self, OrchestratorError> {
        Ok(Self {
            config: HttpEndpointConfig::resolve(
                &endpoint.url,
                endpoint.timeout_ms,
                &endpoint.headers,
                endpoint.auth_bearer_env.as_deref(),
            )?,
            max_results: endpoint.max_results,
        })
    }
}

impl SearchService for HttpSearchService {
    fn provider_name(&self) -> &'static str {
        "http_search"
    }

    fn search(&self, query: &str, deadline: &Deadline) -> Result<SearchResponse, OrchestratorError> {
        let body = json!({
            "query": query,
            "max_results": self.max_results,
            "include_answer": true,
        });
        let response = self.config.post_json("web search", &body, deadline)?;
        Ok(parse_search_response(&response))
    }
}

fn parse_search_response(response: &Value) -> SearchResponse {
    let results = response
        .get("results")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let url = item.get("url").and_then(Value::as_str)?;
                    Some(SearchSource {
                        title: item
                            .get("title")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        url: url.to_string(),
                        snippet: item
                            .get("content")
                            .or_else(|| item.get("snippet"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    SearchResponse {
        answer: response
            .get("answer")
            .and_then(Value::as_str)
            .filter(|answer| !answer.trim().is_empty())
            .map(str::to_string),
        results,
    }
}
