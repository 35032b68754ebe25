//! Flow registry
//!
//! Static mapping of (flow, step) to step handler, built once at startup and
//! shared read-only afterwards.

mod meal_plan;
mod onboarding;

pub use meal_plan::generation_stalled;

use crate::generation::GenerationOutcome;
use crate::state_machine::{
    ConversationState, EventKind, FlowContext, FlowId, InboundEvent, Prompt, Step, StepOutcome,
};
use std::collections::HashMap;

/// Pure step handler: same inputs, same outcome, no I/O
pub type StepHandler = fn(&ConversationState, &InboundEvent) -> StepOutcome;

/// Builds the initial step, context and prompt of a flow
pub type EntryPoint = fn() -> FlowEntry;

/// The prompt a user sees at their current step, for re-sending
pub type StepPrompter = fn(&ConversationState) -> Option<Prompt>;

/// Maps a finished generation job onto the awaiting state
pub type GenerationResolver = fn(&ConversationState, &GenerationOutcome) -> Resolution;

#[derive(Debug, Clone, PartialEq)]
pub struct FlowEntry {
    pub step: Step,
    pub context: FlowContext,
    pub prompt: Prompt,
}

/// Where the awaiting state lands once a generation outcome is applied
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub step: Step,
    pub context: FlowContext,
    pub prompt: Prompt,
}

/// Immutable definition of one flow
pub struct FlowDefinition {
    pub id: FlowId,
    pub entry: EntryPoint,
    pub steps: Vec<(Step, StepHandler)>,
    pub current_prompt: StepPrompter,
    pub on_generation: Option<GenerationResolver>,
}

/// Registry of every flow known to the process
pub struct FlowRegistry {
    entries: HashMap<FlowId, EntryPoint>,
    handlers: HashMap<(FlowId, Step), StepHandler>,
    prompters: HashMap<FlowId, StepPrompter>,
    resolvers: HashMap<FlowId, GenerationResolver>,
}

impl FlowRegistry {
    pub fn new(definitions: impl IntoIterator<Item = FlowDefinition>) -> Self {
        let mut entries = HashMap::new();
        let mut handlers = HashMap::new();
        let mut prompters = HashMap::new();
        let mut resolvers = HashMap::new();

        for def in definitions {
            entries.insert(def.id, def.entry);
            prompters.insert(def.id, def.current_prompt);
            for (step, handler) in def.steps {
                handlers.insert((def.id, step), handler);
            }
            if let Some(resolver) = def.on_generation {
                resolvers.insert(def.id, resolver);
            }
        }

        Self {
            entries,
            handlers,
            prompters,
            resolvers,
        }
    }

    /// Registry with every shipped flow
    pub fn builtin() -> Self {
        Self::new([onboarding::definition(), meal_plan::definition()])
    }

    pub fn handler(&self, flow: FlowId, step: Step) -> Option<StepHandler> {
        self.handlers.get(&(flow, step)).copied()
    }

    pub fn entry(&self, flow: FlowId) -> Option<FlowEntry> {
        self.entries.get(&flow).map(|entry| entry())
    }

    /// Prompt for the step `state` is parked at, if its flow is registered
    pub fn reprompt(&self, state: &ConversationState) -> Option<Prompt> {
        self.prompters
            .get(&state.flow)
            .and_then(|prompter| prompter(state))
    }

    pub fn resolver(&self, flow: FlowId) -> Option<GenerationResolver> {
        self.resolvers.get(&flow).copied()
    }

    /// Entry-point resolver: which flow, if any, this event asks to start.
    ///
    /// Explicit flow-start signals always qualify; a choice naming a flow
    /// also does, since the "no active flow" prompt offers flows as choices.
    pub fn flow_to_start(&self, event: &InboundEvent) -> Option<FlowId> {
        let requested = match &event.kind {
            EventKind::FlowStart { flow } => Some(*flow),
            EventKind::Choice { value } => value.trim().parse::<FlowId>().ok(),
            EventKind::Text { .. } | EventKind::Cancel => None,
        }?;
        self.entries.contains_key(&requested).then_some(requested)
    }

    #[allow(dead_code)] // Used in tests
    pub fn flows(&self) -> Vec<FlowId> {
        let mut flows: Vec<_> = self.entries.keys().copied().collect();
        flows.sort_by_key(|f| f.as_str());
        flows
    }
}
