//! Domain constraint: none of the user's exclusions appear in the draft

use super::{Constraints, Guardrail, Tripwire, TripwireReason, Verdict};
use crate::state_machine::DraftPlan;
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::json;

pub struct ForbiddenItemGuardrail;

/// Whole-word, case-insensitive matcher that also accepts simple plurals.
///
/// Matching is lexical only: an exclusion does not reach inside compound
/// words ("nuts" passes "peanuts") and categories are not expanded ("dairy"
/// never matches "milk"). Users are asked to name concrete items.
fn item_pattern(item: &str) -> Option<Regex> {
    let item = item.trim().to_lowercase();
    if item.is_empty() {
        return None;
    }
    let stem = if ["oes", "shes", "ches", "xes"].iter().any(|s| item.ends_with(s)) {
        item.strip_suffix("es")
    } else if item.ends_with('s') && !item.ends_with("ss") {
        item.strip_suffix('s')
    } else {
        None
    }
    .unwrap_or(item.as_str());

    RegexBuilder::new(&format!(r"\b{}(?:e?s)?\b", regex::escape(stem)))
        .case_insensitive(true)
        .build()
        .ok()
}

#[async_trait]
impl Guardrail for ForbiddenItemGuardrail {
    fn name(&self) -> &'static str {
        "forbidden_items"
    }

    async fn check(&self, plan: &DraftPlan, constraints: &Constraints) -> Verdict {
        let mut hits = Vec::new();
        for item in &constraints.forbidden_items {
            let Some(pattern) = item_pattern(item) else {
                continue;
            };
            if let Some(text) = plan.texts().find(|text| pattern.is_match(text)) {
                hits.push(json!({ "item": item, "found_in": text }));
            }
        }

        if hits.is_empty() {
            return Verdict::Pass;
        }

        let items: Vec<&str> = hits
            .iter()
            .filter_map(|hit| hit["item"].as_str())
            .collect();
        Verdict::Fail(
            Tripwire::new(
                TripwireReason::ForbiddenItem,
                format!(
                    "The plan must not contain {}, not even as an optional ingredient.",
                    items.join(", ")
                ),
            )
            .with_detail(json!({ "hits": hits })),
        )
    }
}
