//! Safety validation through the moderation collaborator

use super::{Constraints, Guardrail, Tripwire, TripwireReason, Verdict};
use crate::llm::ModerationService;
use crate::state_machine::DraftPlan;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct ModerationGuardrail {
    service: Arc<dyn ModerationService>,
}

impl ModerationGuardrail {
    pub fn new(service: Arc<dyn ModerationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Guardrail for ModerationGuardrail {
    fn name(&self) -> &'static str {
        "moderation"
    }

    async fn check(&self, plan: &DraftPlan, _constraints: &Constraints) -> Verdict {
        let text = plan.texts().collect::<Vec<_>>().join("\n");

        match self.service.check(&text).await {
            Ok(result) if result.flagged => {
                let reason = result.reason.unwrap_or_else(|| "flagged".to_string());
                Verdict::Fail(
                    Tripwire::new(
                        TripwireReason::Flagged,
                        "The previous plan contained unsafe content. Only suggest safe, ordinary food.",
                    )
                    .with_detail(json!({ "provider": self.service.name(), "reason": reason })),
                )
            }
            Ok(_) => Verdict::Pass,
            Err(e) => {
                tracing::warn!(
                    provider = self.service.name(),
                    error = %e,
                    "Moderation check failed, rejecting draft"
                );
                Verdict::Fail(
                    Tripwire::new(
                        TripwireReason::ModerationUnavailable,
                        "The previous plan could not be safety-checked. Produce the plan again.",
                    )
                    .with_detail(json!({ "provider": self.service.name(), "kind": e.kind.as_str() })),
                )
            }
        }
    }
}
