//! Guardrail pipeline for generated output
//!
//! Validators run in a fixed order (structural, topic, moderation, forbidden
//! items) and the first failing verdict short-circuits the rest. Validators
//! never return errors: a collaborator failure is itself a failing verdict.
//! The pipeline only reports; the generation coordinator decides whether to
//! retry, accept or give up.

mod forbidden;
mod moderation;
mod structural;
mod topic;

pub use forbidden::ForbiddenItemGuardrail;
pub use moderation::ModerationGuardrail;
pub use structural::StructuralGuardrail;
pub use topic::TopicGuardrail;

use crate::llm::ModerationService;
use crate::state_machine::DraftPlan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Domain constraints a draft must honour, snapshotted at launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub expected_days: usize,
    pub forbidden_items: Vec<String>,
}

/// Machine-readable failure reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripwireReason {
    MalformedOutput,
    ShapeMismatch,
    OffTopic,
    Flagged,
    ModerationUnavailable,
    ForbiddenItem,
}

impl TripwireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TripwireReason::MalformedOutput => "malformed_output",
            TripwireReason::ShapeMismatch => "shape_mismatch",
            TripwireReason::OffTopic => "off_topic",
            TripwireReason::Flagged => "flagged",
            TripwireReason::ModerationUnavailable => "moderation_unavailable",
            TripwireReason::ForbiddenItem => "forbidden_item",
        }
    }
}

impl fmt::Display for TripwireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failing verdict
#[derive(Debug, Clone, PartialEq)]
pub struct Tripwire {
    pub reason: TripwireReason,
    /// Structured detail for logs and reinforcement
    pub detail: Option<Value>,
    /// Corrective instruction addressed to the generative service
    pub message: String,
}

impl Tripwire {
    pub fn new(reason: TripwireReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            detail: None,
            message: message.into(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Text appended to the next attempt's request
    pub fn reinforcement(&self) -> String {
        format!("[{}] {}", self.reason, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Fail(Tripwire),
}

impl Verdict {
    #[allow(dead_code)] // Used in tests
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Verdict tagged with the guardrail that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailVerdict {
    pub guardrail: &'static str,
    pub verdict: Verdict,
}

/// Validator over a structurally valid draft
#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, plan: &DraftPlan, constraints: &Constraints) -> Verdict;
}

/// Everything the pipeline concluded about one raw output
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// One verdict per guardrail run, in order; stops at the first failure
    pub verdicts: Vec<GuardrailVerdict>,
    /// Normalised output, present only when every guardrail passed
    pub output: Option<Value>,
}

impl PipelineReport {
    #[allow(dead_code)] // Used in tests
    pub fn passed(&self) -> bool {
        self.output.is_some()
    }

    pub fn first_failure(&self) -> Option<&Tripwire> {
        self.verdicts.iter().find_map(|v| match &v.verdict {
            Verdict::Fail(tripwire) => Some(tripwire),
            Verdict::Pass => None,
        })
    }
}

/// Ordered, short-circuiting guardrail sequence
pub struct GuardrailPipeline {
    checks: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailPipeline {
    /// Standard order: structural, topic, moderation, forbidden items
    pub fn standard(moderation: Arc<dyn ModerationService>) -> Self {
        Self::with_checks(vec![
            Arc::new(TopicGuardrail::new()),
            Arc::new(ModerationGuardrail::new(moderation)),
            Arc::new(ForbiddenItemGuardrail),
        ])
    }

    /// Structural validation followed by the given checks
    pub fn with_checks(checks: Vec<Arc<dyn Guardrail>>) -> Self {
        Self { checks }
    }

    pub async fn evaluate(&self, raw: &str, constraints: &Constraints) -> PipelineReport {
        let mut verdicts = Vec::with_capacity(self.checks.len() + 1);

        let plan = match StructuralGuardrail::parse(raw, constraints) {
            Ok(plan) => {
                verdicts.push(GuardrailVerdict {
                    guardrail: StructuralGuardrail::NAME,
                    verdict: Verdict::Pass,
                });
                plan
            }
            Err(tripwire) => {
                verdicts.push(GuardrailVerdict {
                    guardrail: StructuralGuardrail::NAME,
                    verdict: Verdict::Fail(tripwire),
                });
                return PipelineReport {
                    verdicts,
                    output: None,
                };
            }
        };

        for check in &self.checks {
            let verdict = check.check(&plan, constraints).await;
            let failed = !verdict.is_pass();
            verdicts.push(GuardrailVerdict {
                guardrail: check.name(),
                verdict,
            });
            if failed {
                return PipelineReport {
                    verdicts,
                    output: None,
                };
            }
        }

        PipelineReport {
            verdicts,
            output: serde_json::to_value(&plan).ok(),
        }
    }
}
