//! Common types for generative and moderation calls

use crate::state_machine::GenerationInput;
use serde_json::Value;
use std::fmt::Write as _;

/// One call to the generative service
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub instructions: String,
    pub input_snapshot: Value,
    pub output_contract: String,
    /// Corrective texts from earlier rejected attempts, oldest first
    pub reinforcements: Vec<String>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn from_input(input: &GenerationInput) -> Self {
        Self {
            instructions: input.instructions.clone(),
            input_snapshot: input.snapshot.clone(),
            output_contract: input.output_contract.clone(),
            reinforcements: vec![],
            max_tokens: None,
        }
    }

    /// Same request with one more reinforcement appended
    pub fn reinforced(&self, reinforcement: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.reinforcements.push(reinforcement.into());
        next
    }

    /// System text: instructions followed by the output contract
    pub fn system_text(&self) -> String {
        format!("{}\n\n{}", self.instructions, self.output_contract)
    }

    /// User text: the input snapshot, then any reinforcements
    pub fn user_text(&self) -> String {
        let mut text = format!("Input:\n{}", self.input_snapshot);
        if !self.reinforcements.is_empty() {
            text.push_str("\n\nYour previous answer was rejected. Fix the following:");
            for reinforcement in &self.reinforcements {
                let _ = write!(text, "\n- {reinforcement}");
            }
        }
        text
    }
}

/// Result of a moderation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationResult {
    pub flagged: bool,
    pub reason: Option<String>,
}

impl ModerationResult {
    pub fn clean() -> Self {
        Self {
            flagged: false,
            reason: None,
        }
    }

    pub fn flagged(reason: impl Into<String>) -> Self {
        Self {
            flagged: true,
            reason: Some(reason.into()),
        }
    }
}
