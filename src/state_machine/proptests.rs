//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::*;
use crate::flows::FlowRegistry;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn key() -> RoutingKey {
    RoutingKey {
        user_id: "u1".to_string(),
        channel_id: "c1".to_string(),
    }
}

/// Every (flow, step) pair a stored state can legitimately hold
fn active_positions() -> Vec<(FlowId, Step)> {
    vec![
        (FlowId::Onboarding, Step::AskName),
        (FlowId::Onboarding, Step::AskGoal),
        (FlowId::MealPlan, Step::AskDays),
        (FlowId::MealPlan, Step::AskDesires),
        (FlowId::MealPlan, Step::AskExclusions),
        (FlowId::MealPlan, Step::GeneratingDraft),
        (FlowId::MealPlan, Step::ReviewDraft),
        (FlowId::MealPlan, Step::GenerationFailed),
    ]
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_state() -> impl Strategy<Value = ConversationState> {
    (
        proptest::sample::select(active_positions()),
        0u64..1_000,
        proptest::option::of("[a-z0-9]{4}"),
    )
        .prop_map(|((flow, step), epoch, last_event_id)| {
            let mut state = ConversationState::new("u1", "c1", step, FlowContext::empty(flow));
            state.epoch = epoch;
            state.last_event_id = last_event_id;
            state
        })
}

fn arb_kind() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        ".{0,80}".prop_map(|text| EventKind::Text { text }),
        prop_oneof![
            Just("3".to_string()),
            Just("5".to_string()),
            Just("accept".to_string()),
            Just("relax".to_string()),
            Just("meal_plan".to_string()),
            "[a-z]{0,12}",
        ]
        .prop_map(|value| EventKind::Choice { value }),
        Just(EventKind::Cancel),
        proptest::sample::select(FlowId::ALL.to_vec()).prop_map(|flow| EventKind::FlowStart { flow }),
    ]
}

fn arb_event() -> impl Strategy<Value = InboundEvent> {
    ("[a-z0-9]{8}", arb_kind()).prop_map(|(id, kind)| InboundEvent::new(id, "u1", "c1", kind))
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Cancel clears from any step, regardless of context or epoch
    #[test]
    fn prop_cancel_always_clears(state in arb_state(), id in "[a-z0-9]{8}") {
        let registry = FlowRegistry::builtin();
        let cancel = InboundEvent::new(id, "u1", "c1", EventKind::Cancel);
        let result = transition(&registry, Some(&state), &cancel, &key()).unwrap();
        prop_assert_eq!(result.change, StateChange::Clear);
        prop_assert!(result.effects.iter().all(|e| matches!(e, Effect::Prompt(_))));
    }

    // Every registered step handles every event without error or panic
    #[test]
    fn prop_registered_steps_never_fail(state in arb_state(), event in arb_event()) {
        let registry = FlowRegistry::builtin();
        prop_assert!(transition(&registry, Some(&state), &event, &key()).is_ok());
    }

    // Saves are always checked against the loaded epoch and never name a
    // terminal step
    #[test]
    fn prop_saves_keep_observed_epoch(state in arb_state(), event in arb_event()) {
        let registry = FlowRegistry::builtin();
        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        if let StateChange::Save(next) = &result.change {
            prop_assert_eq!(next.epoch, state.epoch);
            prop_assert!(!next.step.is_terminal());
            prop_assert_eq!(next.context.flow(), next.flow);
            prop_assert_eq!(next.last_event_id.as_deref(), Some(event.event_id.as_str()));
        }
    }

    // A launch effect only ever accompanies a save into an awaiting step
    #[test]
    fn prop_launch_implies_awaiting_save(state in arb_state(), event in arb_event()) {
        let registry = FlowRegistry::builtin();
        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        let launches = result
            .effects
            .iter()
            .filter(|e| matches!(e, Effect::LaunchGeneration(_)))
            .count();
        prop_assert!(launches <= 1);
        if launches == 1 {
            match &result.change {
                StateChange::Save(next) => prop_assert!(next.step.is_awaiting_generation()),
                other => prop_assert!(false, "Launch without save: {:?}", other),
            }
        }
    }

    // Applying the same event twice equals applying it once; the repeat only
    // re-sends the prompt for the step the first delivery reached
    #[test]
    fn prop_redelivery_is_idempotent(state in arb_state(), event in arb_event()) {
        let registry = FlowRegistry::builtin();
        let first = transition(&registry, Some(&state), &event, &key()).unwrap();
        if let StateChange::Save(next) = &first.change {
            let again = transition(&registry, Some(next), &event, &key()).unwrap();
            prop_assert_eq!(&again.change, &StateChange::Unchanged);
            prop_assert_eq!(again.effects.len(), 1);
            let expected = registry.reprompt(next);
            prop_assert_eq!(again.prompts().next(), expected.as_ref());
        }
    }

    // ASK_DAYS accepts exactly 3, 5 and 7
    #[test]
    fn prop_ask_days_accepts_only_allowed(n in 0u32..100) {
        let registry = FlowRegistry::builtin();
        let state = ConversationState::new("u1", "c1", Step::AskDays, FlowContext::empty(FlowId::MealPlan));
        let event = InboundEvent::text("e1", "u1", "c1", n.to_string());
        let result = transition(&registry, Some(&state), &event, &key()).unwrap();
        let advanced = matches!(&result.change, StateChange::Save(next) if next.step == Step::AskDesires);
        prop_assert_eq!(advanced, matches!(n, 3 | 5 | 7));
    }

    // Without an active flow only a flow start creates state
    #[test]
    fn prop_no_state_only_flow_start_saves(event in arb_event()) {
        let registry = FlowRegistry::builtin();
        let result = transition(&registry, None, &event, &key()).unwrap();
        if let StateChange::Save(next) = &result.change {
            prop_assert_eq!(next.epoch, 0);
            prop_assert!(registry.flow_to_start(&event).is_some());
        }
    }
}
