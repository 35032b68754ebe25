//! Meal plan: collect constraints, generate a draft in the background,
//! let the user accept, regenerate, retry or relax.

use super::{FlowDefinition, FlowEntry, Resolution, StepHandler};
use crate::generation::GenerationOutcome;
use crate::guardrails::Constraints;
use crate::state_machine::{
    ConversationState, DraftPlan, FlowContext, FlowId, GenerationInput, InboundEvent,
    MealPlanContext, Prompt, Step, StepOutcome,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

pub const ALLOWED_DAYS: [u8; 3] = [3, 5, 7];
const MAX_DESIRES_CHARS: usize = 500;
const MAX_EXCLUSIONS: usize = 20;
const MAX_EXCLUSION_CHARS: usize = 40;

/// A parked generation older than this is relaunched on the next event
const STALLED_GENERATION_AFTER: Duration = Duration::minutes(10);

const INSTRUCTIONS: &str = "You are a meal planning assistant. Create a practical meal plan \
for the requested number of days that reflects the user's wishes. Only talk about food. \
Never include any excluded item, not even as an optional ingredient.";

const OUTPUT_CONTRACT: &str = r#"Respond with JSON only, no prose, matching:
{"days":[{"day":1,"meals":[{"name":"string","ingredients":["string"]}]}]}
There must be exactly one entry per requested day, numbered from 1, each with at least one meal."#;

const DAYS_QUESTION: &str = "How many days should the plan cover?";

const ACCEPT: &str = "accept";
const REGENERATE: &str = "regenerate";
const RETRY: &str = "retry";
const RELAX: &str = "relax";

pub fn definition() -> FlowDefinition {
    FlowDefinition {
        id: FlowId::MealPlan,
        entry,
        steps: vec![
            (Step::AskDays, ask_days as StepHandler),
            (Step::AskDesires, ask_desires as StepHandler),
            (Step::AskExclusions, ask_exclusions as StepHandler),
            (Step::GeneratingDraft, generating_draft as StepHandler),
            (Step::ReviewDraft, review_draft as StepHandler),
            (Step::GenerationFailed, generation_failed as StepHandler),
        ],
        current_prompt,
        on_generation: Some(resolve_generation),
    }
}

fn entry() -> FlowEntry {
    FlowEntry {
        step: Step::AskDays,
        context: FlowContext::MealPlan(MealPlanContext::default()),
        prompt: days_prompt(DAYS_QUESTION),
    }
}

fn current_prompt(state: &ConversationState) -> Option<Prompt> {
    let prompt = match state.step {
        Step::AskDays => days_prompt(DAYS_QUESTION),
        Step::AskDesires => desires_prompt(),
        Step::AskExclusions => exclusions_prompt(),
        Step::GeneratingDraft => still_working_prompt(),
        Step::ReviewDraft => draft_or_choice_prompt(&context_of(state)),
        Step::GenerationFailed => failure_prompt(),
        _ => return None,
    };
    Some(prompt)
}

// ============================================================================
// Prompts
// ============================================================================

fn days_prompt(content: &str) -> Prompt {
    Prompt::choice(content, ALLOWED_DAYS.map(|d| d.to_string()))
}

fn desires_prompt() -> Prompt {
    Prompt::text("What would you like to eat? Cuisines, dishes, anything you're craving.")
}

fn exclusions_prompt() -> Prompt {
    Prompt::text(
        "Anything I must leave out? Send a comma-separated list (e.g. peanuts, shrimp) or \"none\".",
    )
}

fn still_working_prompt() -> Prompt {
    Prompt::notice("Still working on your plan, hang tight. You can cancel at any time.")
}

fn generating_prompt() -> Prompt {
    Prompt::notice("Putting your plan together. I'll message you when it's ready.")
}

fn review_prompt(draft: &DraftPlan) -> Prompt {
    Prompt::choice(
        format!("Here's your draft:\n\n{}\n\nAccept it or regenerate?", draft.render()),
        [ACCEPT, REGENERATE],
    )
}

fn draft_or_choice_prompt(ctx: &MealPlanContext) -> Prompt {
    match &ctx.draft {
        Some(draft) => review_prompt(draft),
        None => Prompt::choice("Accept the plan or regenerate it?", [ACCEPT, REGENERATE]),
    }
}

fn failure_prompt() -> Prompt {
    Prompt::choice(
        "I couldn't put together a plan that meets all your constraints. \
         You can retry, or relax your exclusions.",
        [RETRY, RELAX],
    )
}

// ============================================================================
// Helpers
// ============================================================================

fn context_of(state: &ConversationState) -> MealPlanContext {
    state.meal_plan().cloned().unwrap_or_default()
}

fn wrap(ctx: MealPlanContext) -> FlowContext {
    FlowContext::MealPlan(ctx)
}

/// Parse an exclusion list; `Ok(vec![])` for "none"
fn parse_exclusions(input: &str) -> Result<Vec<String>, String> {
    let lowered = input.trim().to_lowercase();
    if matches!(lowered.as_str(), "none" | "no" | "nothing" | "-") {
        return Ok(Vec::new());
    }

    let mut items: Vec<String> = Vec::new();
    for raw in lowered.split([',', ';', '\n']) {
        let item = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if item.is_empty() || items.contains(&item) {
            continue;
        }
        if item.chars().count() > MAX_EXCLUSION_CHARS {
            return Err(format!(
                "Each item should be at most {MAX_EXCLUSION_CHARS} characters."
            ));
        }
        items.push(item);
    }

    if items.is_empty() {
        return Err("Please list at least one item, or send \"none\".".to_string());
    }
    if items.len() > MAX_EXCLUSIONS {
        return Err(format!("Please list at most {MAX_EXCLUSIONS} items."));
    }
    Ok(items)
}

/// Build the generation request and park the flow in the awaiting step
fn defer_generation(mut ctx: MealPlanContext, requested_at: DateTime<Utc>) -> StepOutcome {
    let days = ctx.days.unwrap_or(ALLOWED_DAYS[0]);
    ctx.draft = None;
    ctx.last_failure = None;
    ctx.generation_requested_at = Some(requested_at);

    let input = GenerationInput {
        instructions: INSTRUCTIONS.to_string(),
        snapshot: json!({
            "days": days,
            "desires": ctx.desires,
            "exclusions": ctx.exclusions,
        }),
        output_contract: OUTPUT_CONTRACT.to_string(),
        constraints: Constraints {
            expected_days: usize::from(days),
            forbidden_items: ctx.exclusions.clone(),
        },
    };

    StepOutcome::Defer {
        step: Step::GeneratingDraft,
        context: wrap(ctx),
        prompt: generating_prompt(),
        input,
    }
}

// ============================================================================
// Step Handlers
// ============================================================================

fn ask_days(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let days = event
        .answer()
        .and_then(|a| a.parse::<u8>().ok())
        .filter(|d| ALLOWED_DAYS.contains(d));

    match days {
        Some(days) => StepOutcome::advance(
            Step::AskDesires,
            wrap(MealPlanContext {
                days: Some(days),
                ..ctx
            }),
            desires_prompt(),
        ),
        None => StepOutcome::stay(wrap(ctx), days_prompt("Please pick 3, 5 or 7 days.")),
    }
}

fn ask_desires(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let desires = event.answer().unwrap_or_default();
    let len = desires.chars().count();

    if len == 0 || len > MAX_DESIRES_CHARS {
        return StepOutcome::stay(
            wrap(ctx),
            Prompt::text(format!(
                "Please describe what you'd like in 1 to {MAX_DESIRES_CHARS} characters."
            )),
        );
    }

    StepOutcome::advance(
        Step::AskExclusions,
        wrap(MealPlanContext {
            desires: Some(desires.to_string()),
            ..ctx
        }),
        exclusions_prompt(),
    )
}

fn ask_exclusions(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let Some(answer) = event.answer() else {
        return StepOutcome::stay(wrap(ctx), exclusions_prompt());
    };

    match parse_exclusions(answer) {
        Ok(exclusions) => defer_generation(
            MealPlanContext {
                exclusions,
                ..ctx
            },
            event.received_at,
        ),
        Err(message) => StepOutcome::stay(wrap(ctx), Prompt::text(message)),
    }
}

/// Whether a parked generation requested at `requested_at` should be
/// relaunched. A parked state with no request time has no job to wait for.
pub fn generation_stalled(requested_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    !matches!(requested_at, Some(at) if now - at < STALLED_GENERATION_AFTER)
}

fn generating_draft(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);

    if generation_stalled(ctx.generation_requested_at, event.received_at) {
        tracing::info!(user_id = %state.user_id, "Relaunching stalled generation");
        return defer_generation(ctx, event.received_at);
    }

    StepOutcome::stay(wrap(ctx), still_working_prompt())
}

fn review_draft(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let answer = event.answer().map(str::to_lowercase);

    match answer.as_deref() {
        Some(ACCEPT) => {
            let rendered = ctx
                .draft
                .as_ref()
                .map(DraftPlan::render)
                .unwrap_or_default();
            StepOutcome::advance(
                Step::Done,
                wrap(ctx),
                Prompt::notice(format!("Enjoy! Your final plan:\n\n{rendered}")),
            )
        }
        Some(REGENERATE) => defer_generation(ctx, event.received_at),
        _ => {
            let prompt = draft_or_choice_prompt(&ctx);
            StepOutcome::stay(wrap(ctx), prompt)
        }
    }
}

fn generation_failed(state: &ConversationState, event: &InboundEvent) -> StepOutcome {
    let ctx = context_of(state);
    let answer = event.answer().map(str::to_lowercase);

    match answer.as_deref() {
        Some(RETRY) => defer_generation(ctx, event.received_at),
        Some(RELAX) => StepOutcome::advance(
            Step::AskExclusions,
            wrap(MealPlanContext {
                exclusions: Vec::new(),
                last_failure: None,
                ..ctx
            }),
            exclusions_prompt(),
        ),
        _ => StepOutcome::stay(wrap(ctx), failure_prompt()),
    }
}

// ============================================================================
// Generation Outcome
// ============================================================================

fn resolve_generation(state: &ConversationState, outcome: &GenerationOutcome) -> Resolution {
    let mut ctx = context_of(state);
    ctx.generation_requested_at = None;

    let draft = match outcome {
        GenerationOutcome::Succeeded { output, .. } => {
            serde_json::from_value::<DraftPlan>(output.clone()).map_err(|e| e.to_string())
        }
        GenerationOutcome::Failed { failure, .. } => Err(failure.summary()),
    };

    match draft {
        Ok(draft) => {
            let prompt = review_prompt(&draft);
            ctx.draft = Some(draft);
            ctx.last_failure = None;
            Resolution {
                step: Step::ReviewDraft,
                context: wrap(ctx),
                prompt,
            }
        }
        Err(summary) => {
            ctx.draft = None;
            ctx.last_failure = Some(summary);
            Resolution {
                step: Step::GenerationFailed,
                context: wrap(ctx),
                prompt: failure_prompt(),
            }
        }
    }
}
