//! Pure state transition function
//!
//! Given the flow registry, the loaded state and one inbound event, decide
//! the state change and the effects. No I/O happens here; the conversation
//! machine executes the result.

use super::{
    ConversationState, Effect, EventKind, FlowId, InboundEvent, Prompt, RoutingKey, StateChange,
    Step, StepOutcome,
};
use crate::flows::FlowRegistry;
use crate::generation::GenerationOutcome;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub change: StateChange,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(change: StateChange) -> Self {
        Self {
            change,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Prompts emitted by this transition, in order
    #[allow(dead_code)] // Used in tests
    pub fn prompts(&self) -> impl Iterator<Item = &Prompt> {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Prompt(prompt) => Some(prompt),
            Effect::LaunchGeneration(_) => None,
        })
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Stored (flow, step) has no registered handler: a programming error
    #[error("No handler registered for flow {flow} at step {step}")]
    UnknownStep { flow: FlowId, step: Step },
}

/// Pure transition function
///
/// Given the same inputs, it always produces the same outputs.
pub fn transition(
    registry: &FlowRegistry,
    current: Option<&ConversationState>,
    event: &InboundEvent,
    key: &RoutingKey,
) -> Result<TransitionResult, TransitionError> {
    // Cancel is a uniform edge from every step, with or without a state
    if event.is_cancel() {
        return Ok(TransitionResult::new(StateChange::Clear)
            .with_effect(Effect::Prompt(Prompt::returned_to_top())));
    }

    // Redelivery of an event already applied: the reply may have been lost,
    // so repeat the prompt for where the user stands now
    if let Some(state) = current {
        if state.last_event_id.as_deref() == Some(event.event_id.as_str()) {
            let result = TransitionResult::new(StateChange::Unchanged);
            return Ok(match registry.reprompt(state) {
                Some(prompt) => result.with_effect(Effect::Prompt(prompt)),
                None => result,
            });
        }
    }

    if let Some(result) = start_flow(registry, current, event, key) {
        return Ok(result);
    }

    let Some(state) = current else {
        return Ok(TransitionResult::new(StateChange::Unchanged)
            .with_effect(Effect::Prompt(Prompt::no_active_flow())));
    };

    let handler = registry
        .handler(state.flow, state.step)
        .ok_or(TransitionError::UnknownStep {
            flow: state.flow,
            step: state.step,
        })?;

    Ok(apply_outcome(state, handler(state, event), event, key))
}

/// Entry-point handling. With no active flow, any flow-start the registry
/// recognises qualifies; with an active flow only an explicit flow-start
/// does, and it restarts that flow from its entry step.
fn start_flow(
    registry: &FlowRegistry,
    current: Option<&ConversationState>,
    event: &InboundEvent,
    key: &RoutingKey,
) -> Option<TransitionResult> {
    if current.is_some() && !matches!(event.kind, EventKind::FlowStart { .. }) {
        return None;
    }
    let flow = registry.flow_to_start(event)?;
    let entry = registry.entry(flow)?;

    let mut next = match current {
        Some(state) => state.advanced(entry.step, entry.context, Some(&event.event_id)),
        None => {
            let mut fresh =
                ConversationState::new(&key.user_id, &key.channel_id, entry.step, entry.context);
            fresh.last_event_id = Some(event.event_id.clone());
            fresh
        }
    };
    next.channel_id.clone_from(&key.channel_id);

    Some(TransitionResult::new(StateChange::Save(next)).with_effect(Effect::Prompt(entry.prompt)))
}

fn apply_outcome(
    state: &ConversationState,
    outcome: StepOutcome,
    event: &InboundEvent,
    key: &RoutingKey,
) -> TransitionResult {
    let advance = |step, context| {
        let mut next = state.advanced(step, context, Some(&event.event_id));
        next.channel_id.clone_from(&key.channel_id);
        next
    };

    match outcome {
        StepOutcome::Stay { context, prompt } => {
            // A write while parked bumps the epoch and orphans the running job;
            // the reply is still addressed to the event's channel
            let unchanged = context == state.context
                && (key.channel_id == state.channel_id || state.step.is_awaiting_generation());
            let change = if unchanged {
                StateChange::Unchanged
            } else {
                StateChange::Save(advance(state.step, context))
            };
            TransitionResult::new(change).with_effect(Effect::Prompt(prompt))
        }
        StepOutcome::Advance {
            step,
            context,
            prompt,
        } => {
            let change = if step.is_terminal() {
                StateChange::Clear
            } else {
                StateChange::Save(advance(step, context))
            };
            TransitionResult::new(change).with_effect(Effect::Prompt(prompt))
        }
        StepOutcome::Defer {
            step,
            context,
            prompt,
            input,
        } => TransitionResult::new(StateChange::Save(advance(step, context)))
            .with_effect(Effect::Prompt(prompt))
            .with_effect(Effect::LaunchGeneration(input)),
    }
}

// ============================================================================
// Generation Outcome
// ============================================================================

/// Why a finished job's outcome was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The flow was cancelled or finished
    Cleared,
    /// The state moved on since the job was launched
    Superseded,
}

/// Decision for a finished generation job
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationApply {
    Apply {
        state: ConversationState,
        prompt: Prompt,
    },
    Discard(StaleReason),
}

/// Decide what a finished job does to the current state.
///
/// The job only applies when the stored epoch still equals the epoch it was
/// launched against and the state is still parked in an awaiting step of
/// the same flow.
pub fn resolve_generation(
    registry: &FlowRegistry,
    current: Option<&ConversationState>,
    flow: FlowId,
    launch_epoch: u64,
    outcome: &GenerationOutcome,
) -> Result<GenerationApply, TransitionError> {
    let Some(state) = current else {
        return Ok(GenerationApply::Discard(StaleReason::Cleared));
    };
    if state.epoch != launch_epoch || state.flow != flow || !state.step.is_awaiting_generation() {
        return Ok(GenerationApply::Discard(StaleReason::Superseded));
    }

    let resolver = registry.resolver(flow).ok_or(TransitionError::UnknownStep {
        flow,
        step: state.step,
    })?;
    let resolution = resolver(state, outcome);
    Ok(GenerationApply::Apply {
        state: state.advanced(resolution.step, resolution.context, None),
        prompt: resolution.prompt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::FinalFailure;
    use crate::state_machine::{FlowContext, MealPlanContext};
    use serde_json::json;

    fn key() -> RoutingKey {
        RoutingKey {
            user_id: "u1".to_string(),
            channel_id: "c1".to_string(),
        }
    }

    fn stored(step: Step, ctx: MealPlanContext, epoch: u64) -> ConversationState {
        let mut state = ConversationState::new("u1", "c1", step, FlowContext::MealPlan(ctx));
        state.epoch = epoch;
        state
    }

    fn saved(result: &TransitionResult) -> &ConversationState {
        match &result.change {
            StateChange::Save(state) => state,
            other => panic!("Expected Save, got {other:?}"),
        }
    }

    #[test]
    fn test_days_five_advances() {
        let registry = FlowRegistry::builtin();
        let state = stored(Step::AskDays, MealPlanContext::default(), 2);
        let event = InboundEvent::text("e1", "u1", "c1", "5");

        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        let next = saved(&result);
        assert_eq!(next.step, Step::AskDesires);
        assert_eq!(next.meal_plan().unwrap().days, Some(5));
        assert_eq!(next.epoch, 2, "Save must be checked against the loaded epoch");
        assert_eq!(next.last_event_id.as_deref(), Some("e1"));
        assert_eq!(result.prompts().count(), 1);
    }

    #[test]
    fn test_days_four_reprompts_without_write() {
        let registry = FlowRegistry::builtin();
        let state = stored(Step::AskDays, MealPlanContext::default(), 2);
        let event = InboundEvent::text("e1", "u1", "c1", "4");

        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        assert_eq!(result.change, StateChange::Unchanged);
        assert_eq!(result.prompts().count(), 1);
    }

    #[test]
    fn test_cancel_clears_with_or_without_state() {
        let registry = FlowRegistry::builtin();
        let cancel = InboundEvent::new("e1", "u1", "c1", EventKind::Cancel);
        let parked = stored(Step::GeneratingDraft, MealPlanContext::default(), 7);

        for current in [None, Some(&parked)] {
            let result = transition(&registry, current, &cancel, &key()).unwrap();
            assert_eq!(result.change, StateChange::Clear);
            assert_eq!(
                result.prompts().next(),
                Some(&Prompt::returned_to_top())
            );
        }
    }

    #[test]
    fn test_no_active_flow_prompts() {
        let registry = FlowRegistry::builtin();
        let event = InboundEvent::text("e1", "u1", "c1", "hello");
        let result = transition(&registry, None, &event, &key()).unwrap();
        assert_eq!(result.change, StateChange::Unchanged);
        assert_eq!(result.prompts().next(), Some(&Prompt::no_active_flow()));
    }

    #[test]
    fn test_flow_start_creates_entry_state() {
        let registry = FlowRegistry::builtin();
        let event = InboundEvent::new(
            "e1",
            "u1",
            "c1",
            EventKind::FlowStart {
                flow: FlowId::MealPlan,
            },
        );
        let result = transition(&registry, None, &event, &key()).unwrap();
        let next = saved(&result);
        assert_eq!(next.flow, FlowId::MealPlan);
        assert_eq!(next.step, Step::AskDays);
        assert_eq!(next.epoch, 0);
    }

    #[test]
    fn test_flow_start_restarts_active_flow_with_checked_epoch() {
        let registry = FlowRegistry::builtin();
        let state = stored(Step::GeneratingDraft, MealPlanContext::default(), 9);
        let event = InboundEvent::new(
            "e1",
            "u1",
            "c1",
            EventKind::FlowStart {
                flow: FlowId::Onboarding,
            },
        );
        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        let next = saved(&result);
        assert_eq!(next.flow, FlowId::Onboarding);
        assert_eq!(next.step, Step::AskName);
        assert_eq!(next.epoch, 9);
    }

    #[test]
    fn test_choice_naming_flow_is_an_answer_inside_active_flow() {
        let registry = FlowRegistry::builtin();
        let state = stored(Step::AskDays, MealPlanContext::default(), 1);
        let event = InboundEvent::new(
            "e1",
            "u1",
            "c1",
            EventKind::Choice {
                value: "onboarding".to_string(),
            },
        );
        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        assert_eq!(result.change, StateChange::Unchanged);
    }

    #[test]
    fn test_redelivered_event_repeats_current_prompt_without_write() {
        let registry = FlowRegistry::builtin();
        let mut state = stored(Step::AskDesires, MealPlanContext::default(), 3);
        state.last_event_id = Some("e1".to_string());
        let event = InboundEvent::text("e1", "u1", "c1", "5");

        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        assert_eq!(result.change, StateChange::Unchanged);
        let prompts: Vec<_> = result.prompts().collect();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].content.contains("What would you like to eat"));
        assert!(!result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::LaunchGeneration(_))));
    }

    #[test]
    fn test_parked_state_ignores_channel_change() {
        let registry = FlowRegistry::builtin();
        let ctx = MealPlanContext {
            days: Some(3),
            generation_requested_at: Some(chrono::Utc::now()),
            ..MealPlanContext::default()
        };
        let state = stored(Step::GeneratingDraft, ctx, 2);
        let other = RoutingKey {
            user_id: "u1".to_string(),
            channel_id: "c2".to_string(),
        };
        let event = InboundEvent::text("e9", "u1", "c2", "hello?");

        let result = transition(&registry, Some(&state), &event, &other).unwrap();
        assert_eq!(result.change, StateChange::Unchanged);
        assert_eq!(result.prompts().count(), 1);
    }

    #[test]
    fn test_channel_change_is_saved_outside_parked_steps() {
        let registry = FlowRegistry::builtin();
        let state = stored(Step::AskDays, MealPlanContext::default(), 2);
        let other = RoutingKey {
            user_id: "u1".to_string(),
            channel_id: "c2".to_string(),
        };
        let event = InboundEvent::text("e1", "u1", "c2", "4");

        let result = transition(&registry, Some(&state), &event, &other).unwrap();
        assert_eq!(saved(&result).channel_id, "c2");
    }

    #[test]
    fn test_unknown_step_is_an_error() {
        let registry = FlowRegistry::builtin();
        let mut state = stored(Step::AskDays, MealPlanContext::default(), 1);
        state.step = Step::AskName;
        let event = InboundEvent::text("e1", "u1", "c1", "hi");

        let err = transition(&registry, Some(&state), &event, &key()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::UnknownStep {
                flow: FlowId::MealPlan,
                step: Step::AskName
            }
        );
    }

    #[test]
    fn test_terminal_step_clears() {
        let registry = FlowRegistry::builtin();
        let state = ConversationState::new(
            "u1",
            "c1",
            Step::AskGoal,
            FlowContext::empty(FlowId::Onboarding),
        );
        let event = InboundEvent::text("e1", "u1", "c1", "maintain");
        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        assert_eq!(result.change, StateChange::Clear);
    }

    #[test]
    fn test_exclusions_defer_with_launch_effect() {
        let registry = FlowRegistry::builtin();
        let ctx = MealPlanContext {
            days: Some(3),
            desires: Some("soup".to_string()),
            ..MealPlanContext::default()
        };
        let state = stored(Step::AskExclusions, ctx, 4);
        let event = InboundEvent::text("e1", "u1", "c1", "none");

        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        assert_eq!(saved(&result).step, Step::GeneratingDraft);
        assert!(matches!(
            result.effects.last(),
            Some(Effect::LaunchGeneration(_))
        ));
    }

    #[test]
    fn test_generation_outcome_applies_only_on_matching_epoch() {
        let registry = FlowRegistry::builtin();
        let parked = stored(Step::GeneratingDraft, MealPlanContext::default(), 5);
        let outcome = GenerationOutcome::Succeeded {
            output: json!({"days": [{"day": 1, "meals": [{"name": "Stew", "ingredients": []}]}]}),
            attempts: 1,
        };

        match resolve_generation(&registry, Some(&parked), FlowId::MealPlan, 5, &outcome).unwrap() {
            GenerationApply::Apply { state, .. } => {
                assert_eq!(state.step, Step::ReviewDraft);
                assert_eq!(state.epoch, 5);
            }
            GenerationApply::Discard(reason) => panic!("Unexpected discard: {reason:?}"),
        }

        assert_eq!(
            resolve_generation(&registry, Some(&parked), FlowId::MealPlan, 4, &outcome).unwrap(),
            GenerationApply::Discard(StaleReason::Superseded)
        );
        assert_eq!(
            resolve_generation(&registry, None, FlowId::MealPlan, 5, &outcome).unwrap(),
            GenerationApply::Discard(StaleReason::Cleared)
        );
    }

    #[test]
    fn test_generation_failure_lands_on_recoverable_step() {
        let registry = FlowRegistry::builtin();
        let parked = stored(Step::GeneratingDraft, MealPlanContext::default(), 5);
        let outcome = GenerationOutcome::Failed {
            failure: FinalFailure::TimedOut,
            attempts: 3,
        };
        match resolve_generation(&registry, Some(&parked), FlowId::MealPlan, 5, &outcome).unwrap() {
            GenerationApply::Apply { state, .. } => assert_eq!(state.step, Step::GenerationFailed),
            GenerationApply::Discard(reason) => panic!("Unexpected discard: {reason:?}"),
        }
    }
}
