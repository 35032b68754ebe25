//! Conversation state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Flow and Step Identifiers
// ============================================================================

/// Statically known workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowId {
    Onboarding,
    MealPlan,
}

impl FlowId {
    pub const ALL: [FlowId; 2] = [FlowId::Onboarding, FlowId::MealPlan];

    pub fn as_str(self) -> &'static str {
        match self {
            FlowId::Onboarding => "onboarding",
            FlowId::MealPlan => "meal_plan",
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlowId::ALL
            .into_iter()
            .find(|flow| flow.as_str() == s)
            .ok_or_else(|| format!("unknown flow: {s}"))
    }
}

/// Step identifiers across all flows.
///
/// Which steps belong to which flow is decided by the flow registry, not by
/// this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    AskName,
    AskGoal,
    AskDays,
    AskDesires,
    AskExclusions,
    GeneratingDraft,
    ReviewDraft,
    GenerationFailed,
    /// Terminal step: naming it clears the state
    Done,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::AskName,
        Step::AskGoal,
        Step::AskDays,
        Step::AskDesires,
        Step::AskExclusions,
        Step::GeneratingDraft,
        Step::ReviewDraft,
        Step::GenerationFailed,
        Step::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::AskName => "ASK_NAME",
            Step::AskGoal => "ASK_GOAL",
            Step::AskDays => "ASK_DAYS",
            Step::AskDesires => "ASK_DESIRES",
            Step::AskExclusions => "ASK_EXCLUSIONS",
            Step::GeneratingDraft => "GENERATING_DRAFT",
            Step::ReviewDraft => "REVIEW_DRAFT",
            Step::GenerationFailed => "GENERATION_FAILED",
            Step::Done => "DONE",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Done)
    }

    /// Steps parked while a background generation job is outstanding
    pub fn is_awaiting_generation(self) -> bool {
        matches!(self, Step::GeneratingDraft)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown step: {s}"))
    }
}

// ============================================================================
// Flow Context - typed, per-flow accumulated answers
// ============================================================================

/// Onboarding goal choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Lose,
    Maintain,
    Gain,
}

impl Goal {
    pub const OPTIONS: [&'static str; 3] = ["lose", "maintain", "gain"];

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "lose" => Some(Goal::Lose),
            "maintain" => Some(Goal::Maintain),
            "gain" => Some(Goal::Gain),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Goal::Lose => "losing weight",
            Goal::Maintain => "maintaining your weight",
            Goal::Gain => "gaining muscle",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingContext {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub goal: Option<Goal>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealPlanContext {
    #[serde(default)]
    pub days: Option<u8>,
    #[serde(default)]
    pub desires: Option<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Last draft that passed every guardrail
    #[serde(default)]
    pub draft: Option<DraftPlan>,
    /// Neutral summary of the last final failure
    #[serde(default)]
    pub last_failure: Option<String>,
    /// When the outstanding generation was requested
    #[serde(default)]
    pub generation_requested_at: Option<DateTime<Utc>>,
}

/// Flow-scoped context, one variant per flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum FlowContext {
    Onboarding(OnboardingContext),
    MealPlan(MealPlanContext),
}

impl FlowContext {
    pub fn empty(flow: FlowId) -> Self {
        match flow {
            FlowId::Onboarding => FlowContext::Onboarding(OnboardingContext::default()),
            FlowId::MealPlan => FlowContext::MealPlan(MealPlanContext::default()),
        }
    }

    pub fn flow(&self) -> FlowId {
        match self {
            FlowContext::Onboarding(_) => FlowId::Onboarding,
            FlowContext::MealPlan(_) => FlowId::MealPlan,
        }
    }
}

// ============================================================================
// Generated Draft
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meal {
    pub name: String,
    #[serde(default)]
    pub ingredients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayPlan {
    pub day: u8,
    pub meals: Vec<Meal>,
}

/// A meal plan draft as produced by the generative service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPlan {
    pub days: Vec<DayPlan>,
}

impl DraftPlan {
    /// Every user-visible string in the draft, for text-level checks
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.days.iter().flat_map(|day| {
            day.meals.iter().flat_map(|meal| {
                std::iter::once(meal.name.as_str()).chain(meal.ingredients.iter().map(String::as_str))
            })
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for day in &self.days {
            out.push_str(&format!("Day {}\n", day.day));
            for meal in &day.meals {
                if meal.ingredients.is_empty() {
                    out.push_str(&format!("  - {}\n", meal.name));
                } else {
                    out.push_str(&format!("  - {} ({})\n", meal.name, meal.ingredients.join(", ")));
                }
            }
        }
        out.trim_end().to_string()
    }
}

// ============================================================================
// Conversation State
// ============================================================================

/// One active conversation per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub channel_id: String,
    pub flow: FlowId,
    pub step: Step,
    pub context: FlowContext,
    /// Epoch observed when this state was loaded (0 = not yet stored)
    pub epoch: u64,
    pub updated_at: DateTime<Utc>,
    /// Last inbound event durably applied, for redelivery detection
    #[serde(default)]
    pub last_event_id: Option<String>,
}

impl ConversationState {
    /// A not-yet-persisted state at the given entry step
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        step: Step,
        context: FlowContext,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            flow: context.flow(),
            step,
            context,
            epoch: 0,
            updated_at: Utc::now(),
            last_event_id: None,
        }
    }

    /// Copy of this state moved to `step` with a new context, keeping the
    /// observed epoch so the write stays epoch-checked.
    pub fn advanced(&self, step: Step, context: FlowContext, event_id: Option<&str>) -> Self {
        Self {
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            flow: context.flow(),
            step,
            context,
            epoch: self.epoch,
            updated_at: Utc::now(),
            last_event_id: event_id.map(String::from).or_else(|| self.last_event_id.clone()),
        }
    }

    pub fn meal_plan(&self) -> Option<&MealPlanContext> {
        match &self.context {
            FlowContext::MealPlan(ctx) => Some(ctx),
            FlowContext::Onboarding(_) => None,
        }
    }
}
