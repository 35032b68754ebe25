//! Onboarding: name, then goal

use super::{FlowDefinition, FlowEntry, StepHandler};
use crate::state_machine::{
    ConversationState, FlowContext, FlowId, Goal, InboundEvent, OnboardingContext, Prompt, Step,
    StepOutcome,
};

const MAX_NAME_CHARS: usize = 64;

pub fn definition() -> FlowDefinition {
    FlowDefinition {
        id: FlowId::Onboarding,
        entry,
        steps: vec![
            (Step::AskName, ask_name as StepHandler),
            (Step::AskGoal, ask_goal as StepHandler),
        ],
        current_prompt,
        on_generation: None,
    }
}

fn entry() -> FlowEntry {
    FlowEntry {
        step: Step::AskName,
        context: FlowContext::Onboarding(OnboardingContext::default()),
        prompt: name_prompt(),
    }
}

fn context_of(state: &ConversationState) -> OnboardingContext {
    match &state.context {
        FlowContext::Onboarding(ctx) => ctx.clone(),
        FlowContext::MealPlan(_) => OnboardingContext::default(),
    }
}

fn current_prompt(state: &ConversationState) -> Option<Prompt> {
    match state.step {
        Step::AskName => Some(name_prompt()),
        Step::AskGoal => {
            let ctx = context_of(state);
            Some(goal_prompt(ctx.name.as_deref().unwrap_or("there")))
        }
        _ => None,
    }
}

fn name_prompt() -> Prompt {
    Prompt::text("Welcome! What should I call you?")
}

fn goal_prompt(name: &str) -> Prompt {
    Prompt::choice(
        format!("Nice to meet you, {name}. What is your main goal?"),
        Goal::OPTIONS,
    )
}

fn ask_name(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let name = event.answer().unwrap_or_default();
    let len = name.chars().count();

    if len == 0 || len > MAX_NAME_CHARS {
        return StepOutcome::stay(
            FlowContext::Onboarding(ctx),
            Prompt::text(format!(
                "Please send a name between 1 and {MAX_NAME_CHARS} characters."
            )),
        );
    }

    let prompt = goal_prompt(name);
    StepOutcome::advance(
        Step::AskGoal,
        FlowContext::Onboarding(OnboardingContext {
            name: Some(name.to_string()),
            ..ctx
        }),
        prompt,
    )
}

fn ask_goal(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let Some(goal) = event.answer().and_then(Goal::parse) else {
        return StepOutcome::stay(
            FlowContext::Onboarding(ctx),
            Prompt::choice("Please pick one of the options.", Goal::OPTIONS),
        );
    };

    let name = ctx.name.clone().unwrap_or_else(|| "there".to_string());
    StepOutcome::advance(
        Step::Done,
        FlowContext::Onboarding(OnboardingContext {
            goal: Some(goal),
            ..ctx
        }),
        Prompt::notice(format!(
            "All set, {name}. We'll focus on {}.",
            goal.describe()
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(step: Step, ctx: OnboardingContext) -> ConversationState {
        ConversationState::new("u1", "c1", step, FlowContext::Onboarding(ctx))
    }

    #[test]
    fn test_name_advances_to_goal() {
        let state = state_at(Step::AskName, OnboardingContext::default());
        let outcome = ask_name(&state, &InboundEvent::text("e1", "u1", "c1", " Ada "));
        match outcome {
            StepOutcome::Advance { step, context, .. } => {
                assert_eq!(step, Step::AskGoal);
                assert_eq!(
                    context,
                    FlowContext::Onboarding(OnboardingContext {
                        name: Some("Ada".to_string()),
                        goal: None,
                    })
                );
            }
            other => panic!("Expected Advance, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_or_long_name_reprompts() {
        let state = state_at(Step::AskName, OnboardingContext::default());
        let long = "x".repeat(MAX_NAME_CHARS + 1);
        for text in ["   ", long.as_str()] {
            let outcome = ask_name(&state, &InboundEvent::text("e1", "u1", "c1", text));
            assert!(matches!(outcome, StepOutcome::Stay { .. }));
        }
    }

    #[test]
    fn test_goal_finishes_flow() {
        let state = state_at(
            Step::AskGoal,
            OnboardingContext {
                name: Some("Ada".to_string()),
                goal: None,
            },
        );
        let outcome = ask_goal(&state, &InboundEvent::text("e2", "u1", "c1", "Gain"));
        match outcome {
            StepOutcome::Advance { step, prompt, .. } => {
                assert!(step.is_terminal());
                assert!(prompt.content.contains("Ada"));
                assert!(prompt.content.contains("gaining muscle"));
            }
            other => panic!("Expected Advance, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_goal_reprompts() {
        let state = state_at(Step::AskGoal, OnboardingContext::default());
        let outcome = ask_goal(&state, &InboundEvent::text("e2", "u1", "c1", "fly"));
        assert!(matches!(outcome, StepOutcome::Stay { .. }));
    }
}
