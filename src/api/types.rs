//! API request and response types

use crate::db::FlowCount;
use crate::state_machine::OutboundPrompt;
use serde::{Deserialize, Serialize};

/// Prompts produced by one inbound event
#[derive(Debug, Serialize, Deserialize)]
pub struct EventResponse {
    pub prompts: Vec<OutboundPrompt>,
}

/// Active conversation counts
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub flows: Vec<FlowCount>,
    pub total_active: u64,
    pub active_workers: usize,
}

/// Optional filter for the prompt stream
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub user_id: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
