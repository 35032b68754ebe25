//! Core conversation state machine
//!
//! Pure transitions over a persisted per-user state: the transition function
//! decides, the conversation machine executes.

mod effect;
pub mod event;
pub mod state;
pub mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, GenerationInput, StateChange, StepOutcome};
pub use event::{Awaits, EventKind, InboundEvent, OutboundPrompt, Prompt, RoutingKey};
pub use state::{
    ConversationState, DayPlan, DraftPlan, FlowContext, FlowId, Goal, Meal, MealPlanContext,
    OnboardingContext, Step,
};
pub use transition::{
    resolve_generation, transition, GenerationApply, StaleReason, TransitionError,
    TransitionResult,
};
