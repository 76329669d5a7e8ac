#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use analyst_center_capability::{CapabilityCall, CapabilityRegistry, Collaborators};
use analyst_center_config::{resolve_enabled_capabilities, validate_overrides};
use analyst_center_domain::{
    ensure_non_empty, hash_json, now_utc, CapabilityKind, Deadline, NormalizedConfigEnvelope,
    OrchestratorError, RequestState, RunId, RunOverrides, RunResponse,
};
use analyst_center_provider::TextGenerator;
use analyst_center_trace::{archive_completed_run, ArchivedRun, RunArchive};
use tracing::{error, info, info_span, warn};

mod assemble;
mod executor;
mod planner;
mod policy;

pub use assemble::{assemble_response, final_answer};
pub use executor::{decide, Route};
pub use planner::{parse_plan, run_planner, ParsedPlan};
pub use policy::{policy_for, NeverReplan, OnCapabilityFailure, ReplanPolicy};

pub struct Orchestrator<'a> {
    config: &'a NormalizedConfigEnvelope,
    generator: &'a dyn TextGenerator,
    registry: CapabilityRegistry<'a>,
    kinds: BTreeMap<String, CapabilityKind>,
    replan_policy: &'a dyn ReplanPolicy,
    archive: Option<&'a dyn RunArchive>,
}

impl<'a> Orchestrator<'a> {
    /// Resolve every configured capability against the supplied collaborators.
    ///
    /// # Errors
    /// Returns `Configuration` when a capability lacks a required collaborator.
    pub fn new(
        config: &'a NormalizedConfigEnvelope,
        collaborators: Collaborators<'a>,
    ) -> Result<Self, OrchestratorError> {
        let registry = CapabilityRegistry::build(&config.config, collaborators)?;
        let kinds = registry.kinds();
        Ok(Self {
            config,
            generator: collaborators.generator,
            registry,
            kinds,
            replan_policy: policy_for(config.config.replan_policy),
            archive: None,
        })
    }

    #[must_use]
    pub fn with_replan_policy(mut self, policy: &'a dyn ReplanPolicy) -> Self {
        self.replan_policy = policy;
        self
    }

    /// Write each completed run to `archive`.
    #[must_use]
    pub fn with_archive(mut self, archive: &'a dyn RunArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Plan and execute one analytical request.
    ///
    /// # Errors
    /// Returns `Configuration` for invalid input, `PlanParse` when the planner
    /// output is unusable, and `Transport`/`Timeout` when an external call fails.
    pub fn run(
        &self,
        user_query: &str,
        enabled_capabilities: &[String],
        overrides: &RunOverrides,
    ) -> Result<RunResponse, OrchestratorError> {
        let run_id = RunId::new();
        let span = info_span!("run", %run_id);
        let _entered = span.enter();

        let outcome = self.execute(run_id, user_query, enabled_capabilities, overrides);
        match &outcome {
            Ok(response) => info!(
                steps = response.metadata.step_count,
                replans = response.metadata.replan_count,
                trace_records = response.trace_records.len(),
                "run completed"
            ),
            Err(err) => error!(code = err.code(), error = %err, "run failed"),
        }
        outcome
    }

    fn execute(
        &self,
        run_id: RunId,
        user_query: &str,
        enabled_capabilities: &[String],
        overrides: &RunOverrides,
    ) -> Result<RunResponse, OrchestratorError> {
        let config = &self.config.config;
        ensure_non_empty("user_query", user_query)
            .map_err(|err| OrchestratorError::Configuration(err.to_string()))?;
        validate_overrides(config, overrides)
            .map_err(|err| OrchestratorError::Configuration(err.to_string()))?;
        let enabled = resolve_enabled_capabilities(config, enabled_capabilities)
            .map_err(|err| OrchestratorError::Configuration(err.to_string()))?;

        let timeout_ms = overrides
            .request_timeout_ms
            .unwrap_or(config.limits.request_timeout_ms);
        let deadline = Deadline::after(Duration::from_millis(timeout_ms));
        let planner_model = overrides
            .planner_model
            .as_deref()
            .unwrap_or(&config.planner.model_id);

        info!(capabilities = ?enabled, timeout_ms, "run started");
        let mut state = RequestState::new(run_id, user_query.trim(), enabled);
        run_planner(
            &mut state,
            self.generator,
            &self.registry,
            planner_model,
            &deadline,
        )?;

        loop {
            match decide(&mut state, config.limits.max_replans) {
                Route::Plan => run_planner(
                    &mut state,
                    self.generator,
                    &self.registry,
                    planner_model,
                    &deadline,
                )?,
                Route::Dispatch {
                    capability,
                    instruction,
                } => self.dispatch(&mut state, &capability, &instruction, overrides, &deadline)?,
                Route::Finalize => break,
            }
        }

        let response = assemble_response(&state, &self.kinds);
        state.final_answer = Some(response.answer.clone());
        state.formatted_response = serde_json::to_value(&response).ok();
        if let Some(archive) = self.archive {
            if let Err(err) = self.archive_run(archive, &state, &response) {
                warn!(error = %err, "failed to archive completed run");
            }
        }
        Ok(response)
    }

    fn dispatch(
        &self,
        state: &mut RequestState,
        capability: &str,
        instruction: &str,
        overrides: &RunOverrides,
        deadline: &Deadline,
    ) -> Result<(), OrchestratorError> {
        let adapter = self.registry.get(capability).ok_or_else(|| {
            OrchestratorError::Configuration(format!("capability `{capability}` is not configured"))
        })?;
        let model_id = overrides
            .capability_models
            .get(capability)
            .map(String::as_str)
            .or_else(|| self.registry.default_model(capability))
            .unwrap_or_default()
            .to_string();
        let action = state
            .current_step_definition()
            .map(|step| step.action.clone())
            .unwrap_or_default();

        let output = adapter.invoke(&CapabilityCall {
            user_query: &state.user_query,
            action: &action,
            instruction,
            history: state.history(),
            model_id: &model_id,
            deadline,
        })?;

        info!(
            step = state.current_step,
            capability,
            status = output.message.status.as_str(),
            "capability completed"
        );
        state.model_usage.insert(capability.to_string(), model_id);
        state.append_message(output.message);

        if !state.replanning_disabled && self.replan_policy.should_replan(state) {
            info!(policy = self.replan_policy.name(), "replan requested");
            state.replan_requested = true;
        }
        Ok(())
    }

    fn archive_run(
        &self,
        archive: &dyn RunArchive,
        state: &RequestState,
        response: &RunResponse,
    ) -> anyhow::Result<()> {
        let response_json = match &state.formatted_response {
            Some(value) => value.clone(),
            None => serde_json::to_value(response)?,
        };
        let run = ArchivedRun {
            run_id: state.run_id,
            created_at: now_utc(),
            user_query: state.user_query.clone(),
            enabled_capabilities: state.enabled_capabilities.clone(),
            config_hash: self.config.normalized_hash.clone(),
            plan: serde_json::to_value(&state.plan)?,
            models_used: state.model_usage.clone(),
            answer: response.answer.clone(),
            step_count: response.metadata.step_count,
            replan_count: state.replan_count,
            response_hash: hash_json(&response_json)?,
        };
        archive_completed_run(archive, &run, state.history(), &response.trace_records)
    }
}
