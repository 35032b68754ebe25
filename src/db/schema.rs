//! Database schema and row types

use crate::state_machine::FlowId;
use serde::Serialize;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversation_states (
    user_id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    flow TEXT NOT NULL,
    step TEXT NOT NULL,
    context TEXT NOT NULL,
    epoch INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    last_event_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversation_states_flow ON conversation_states(flow);
CREATE INDEX IF NOT EXISTS idx_conversation_states_updated ON conversation_states(updated_at);

-- Highest epoch ever issued per user; survives clears so epochs never repeat
CREATE TABLE IF NOT EXISTS epoch_watermarks (
    user_id TEXT PRIMARY KEY,
    epoch INTEGER NOT NULL
);
";

/// Raw `conversation_states` row before decoding
#[derive(Debug, Clone)]
pub(super) struct StateRow {
    pub user_id: String,
    pub channel_id: String,
    pub flow: String,
    pub step: String,
    pub context: String,
    pub epoch: i64,
    pub updated_at: String,
    pub last_event_id: Option<String>,
}

impl StateRow {
    pub const COLUMNS: &'static str =
        "user_id, channel_id, flow, step, context, epoch, updated_at, last_event_id";

    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            channel_id: row.get(1)?,
            flow: row.get(2)?,
            step: row.get(3)?,
            context: row.get(4)?,
            epoch: row.get(5)?,
            updated_at: row.get(6)?,
            last_event_id: row.get(7)?,
        })
    }
}

/// Active conversations per flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowCount {
    pub flow: FlowId,
    pub active: u64,
}
