//! Structural validation: the output parses and has the contracted shape

use super::{Constraints, Tripwire, TripwireReason};
use crate::state_machine::DraftPlan;
use serde_json::json;

pub struct StructuralGuardrail;

impl StructuralGuardrail {
    pub const NAME: &'static str = "structural";

    /// Parse raw output into a draft, or explain why it does not conform
    pub fn parse(raw: &str, constraints: &Constraints) -> Result<DraftPlan, Tripwire> {
        let Some(body) = extract_json_object(raw) else {
            return Err(Tripwire::new(
                TripwireReason::MalformedOutput,
                "Respond with a single JSON object and nothing else.",
            ));
        };

        let plan: DraftPlan = serde_json::from_str(body).map_err(|e| {
            Tripwire::new(
                TripwireReason::MalformedOutput,
                "The JSON did not match the required format. Follow the output contract exactly.",
            )
            .with_detail(json!({ "parse_error": e.to_string() }))
        })?;

        check_shape(&plan, constraints)?;
        Ok(plan)
    }
}

/// Outermost `{ ... }` span, tolerating code fences and surrounding prose
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    raw.get(start..=end)
}

fn check_shape(plan: &DraftPlan, constraints: &Constraints) -> Result<(), Tripwire> {
    if plan.days.len() != constraints.expected_days {
        return Err(Tripwire::new(
            TripwireReason::ShapeMismatch,
            format!(
                "Return exactly {} days; you returned {}.",
                constraints.expected_days,
                plan.days.len()
            ),
        )
        .with_detail(json!({
            "expected_days": constraints.expected_days,
            "actual_days": plan.days.len(),
        })));
    }

    for (index, day) in plan.days.iter().enumerate() {
        let expected = index + 1;
        if usize::from(day.day) != expected {
            return Err(Tripwire::new(
                TripwireReason::ShapeMismatch,
                "Number the days consecutively starting from 1.",
            )
            .with_detail(json!({ "position": expected, "day": day.day })));
        }
        if day.meals.is_empty() {
            return Err(Tripwire::new(
                TripwireReason::ShapeMismatch,
                format!("Day {} has no meals; every day needs at least one.", day.day),
            )
            .with_detail(json!({ "day": day.day })));
        }
        if day.meals.iter().any(|meal| meal.name.trim().is_empty()) {
            return Err(Tripwire::new(
                TripwireReason::ShapeMismatch,
                format!("Every meal on day {} needs a name.", day.day),
            )
            .with_detail(json!({ "day": day.day })));
        }
    }

    Ok(())
}
