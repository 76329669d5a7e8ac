use analyst_center_domain::{MessageStatus, ReplanPolicyKind, RequestState, PLANNER_TAG};

/// Decides, after each capability message, whether the plan should be revised.
pub trait ReplanPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_replan(&self, state: &RequestState) -> bool;
}

/// Replan when the latest capability message reports an explicit failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnCapabilityFailure;

impl ReplanPolicy for OnCapabilityFailure {
    fn name(&self) -> &'static str {
        "on_failure"
    }

    fn should_replan(&self, state: &RequestState) -> bool {
        state.latest_message().is_some_and(|message| {
            message.author != PLANNER_TAG && message.status == MessageStatus::Failed
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReplan;

impl ReplanPolicy for NeverReplan {
    fn name(&self) -> &'static str {
        "never"
    }

    fn should_replan(&self, _state: &RequestState) -> bool {
        false
    }
}

static ON_CAPABILITY_FAILURE: OnCapabilityFailure = OnCapabilityFailure;
static NEVER_REPLAN: NeverReplan = NeverReplan;

#[must_use]
pub fn policy_for(kind: ReplanPolicyKind) -> &'static dyn ReplanPolicy {
    match kind {
        ReplanPolicyKind::OnFailure => &ON_CAPABILITY_FAILURE,
        ReplanPolicyKind::Never => &NEVER_REPLAN,
    }
}
