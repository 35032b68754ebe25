//! Topic/scope validation: the draft talks about food and nothing else

use super::{Constraints, Guardrail, Tripwire, TripwireReason, Verdict};
use crate::state_machine::DraftPlan;
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::json;

const MAX_MEAL_NAME_CHARS: usize = 80;

/// Phrases that never belong in a meal plan
const OFF_TOPIC_MARKERS: &[(&str, &str)] = &[
    ("assistant_disclaimer", r"\bas an ai\b|\blanguage model\b"),
    ("refusal", r"\bi can(?:no|')t (?:help|assist)\b"),
    ("link", r"https?://|\bwww\."),
    ("promotion", r"\bclick here\b|\bsubscribe\b|\bpromo code\b"),
    ("finance", r"\bcrypto(?:currency)?\b|\bcasino\b|\bstock tips?\b"),
];

pub struct TopicGuardrail {
    markers: Vec<(&'static str, Regex)>,
}

impl TopicGuardrail {
    pub fn new() -> Self {
        let markers = OFF_TOPIC_MARKERS
            .iter()
            .filter_map(|(label, pattern)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|regex| (*label, regex))
            })
            .collect();
        Self { markers }
    }
}

impl Default for TopicGuardrail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Guardrail for TopicGuardrail {
    fn name(&self) -> &'static str {
        "topic"
    }

    async fn check(&self, plan: &DraftPlan, _constraints: &Constraints) -> Verdict {
        for text in plan.texts() {
            if let Some((label, _)) = self.markers.iter().find(|(_, regex)| regex.is_match(text)) {
                return Verdict::Fail(
                    Tripwire::new(
                        TripwireReason::OffTopic,
                        "Only list dishes and their ingredients. No commentary, links or other topics.",
                    )
                    .with_detail(json!({ "marker": label, "text": text })),
                );
            }
        }

        let long_name = plan
            .days
            .iter()
            .flat_map(|day| &day.meals)
            .find(|meal| meal.name.chars().count() > MAX_MEAL_NAME_CHARS);
        if let Some(meal) = long_name {
            return Verdict::Fail(
                Tripwire::new(
                    TripwireReason::OffTopic,
                    format!("Meal names must be short dish names of at most {MAX_MEAL_NAME_CHARS} characters."),
                )
                .with_detail(json!({ "text": meal.name })),
            );
        }

        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{DayPlan, Meal};

    fn plan(name: &str) -> DraftPlan {
        DraftPlan {
            days: vec![DayPlan {
                day: 1,
                meals: vec![Meal {
                    name: name.to_string(),
                    ingredients: vec!["rice".to_string()],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_food_passes() {
        let verdict = TopicGuardrail::new()
            .check(&plan("Chicken curry"), &Constraints::default())
            .await;
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn test_off_topic_markers_fail() {
        let guardrail = TopicGuardrail::new();
        for name in [
            "As an AI, I suggest rice",
            "See https://example.com for recipes",
            "Buy Crypto with your lunch money",
        ] {
            match guardrail.check(&plan(name), &Constraints::default()).await {
                Verdict::Fail(tripwire) => assert_eq!(tripwire.reason, TripwireReason::OffTopic),
                Verdict::Pass => panic!("Expected off-topic failure for {name:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_essay_as_meal_name_fails() {
        let verdict = TopicGuardrail::new()
            .check(&plan(&"very long dish ".repeat(10)), &Constraints::default())
            .await;
        assert!(!verdict.is_pass());
    }
}
