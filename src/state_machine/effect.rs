//! Step outcomes and the effects they produce

use super::event::Prompt;
use super::state::{ConversationState, FlowContext, Step};
use crate::guardrails::Constraints;
use serde_json::Value;

/// Everything a generation job needs, snapshotted from context at launch
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationInput {
    pub instructions: String,
    pub snapshot: Value,
    pub output_contract: String,
    pub constraints: Constraints,
}

/// What a step handler decided
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Re-prompt the same step; context may still change
    Stay { context: FlowContext, prompt: Prompt },
    /// Move to another step (the terminal step clears the state)
    Advance {
        step: Step,
        context: FlowContext,
        prompt: Prompt,
    },
    /// Park in an awaiting step and hand work to the generation coordinator
    Defer {
        step: Step,
        context: FlowContext,
        prompt: Prompt,
        input: GenerationInput,
    },
}

impl StepOutcome {
    pub fn stay(context: FlowContext, prompt: Prompt) -> Self {
        StepOutcome::Stay { context, prompt }
    }

    pub fn advance(step: Step, context: FlowContext, prompt: Prompt) -> Self {
        StepOutcome::Advance {
            step,
            context,
            prompt,
        }
    }
}

/// Side effects to be executed after a transition, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a prompt to the user's channel
    Prompt(Prompt),
    /// Launch a background generation job against the epoch just written
    LaunchGeneration(GenerationInput),
}

/// How the stored row changes
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    /// No write (re-prompt without context change, or a redelivery)
    Unchanged,
    /// Epoch-checked save of this state
    Save(ConversationState),
    /// Delete the row (cancel, terminal step)
    Clear,
}
