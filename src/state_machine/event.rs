//! Inbound events and outbound prompts exchanged with the transport

use super::state::FlowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the user did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Free text typed by the user
    Text { text: String },
    /// A choice picked from an offered choice set
    Choice { value: String },
    /// Global cancel, valid from any step
    Cancel,
    /// Explicit request to start a flow
    FlowStart { flow: FlowId },
}

/// Event delivered by the transport collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Transport-assigned id; redeliveries carry the same id
    pub event_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// User and channel an event is addressed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub user_id: String,
    pub channel_id: String,
}

impl InboundEvent {
    pub fn new(
        event_id: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            user_id: Some(user_id.into()),
            channel_id: Some(channel_id.into()),
            kind,
            received_at: Utc::now(),
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn text(
        event_id: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(event_id, user_id, channel_id, EventKind::Text { text: text.into() })
    }

    /// Routing key, or `None` for unaddressable input
    pub fn routing_key(&self) -> Option<RoutingKey> {
        let user_id = self.user_id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let channel_id = self.channel_id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some(RoutingKey {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
        })
    }

    /// Text or choice payload, trimmed
    pub fn answer(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Text { text } => Some(text.trim()),
            EventKind::Choice { value } => Some(value.trim()),
            EventKind::Cancel | EventKind::FlowStart { .. } => None,
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self.kind, EventKind::Cancel)
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Input shape expected after a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Awaits {
    FreeText,
    ChoiceSet { options: Vec<String> },
    /// Nothing is expected (informational message)
    Nothing,
}

/// Prompt content produced by a step, before it is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub content: String,
    pub awaits: Awaits,
}

impl Prompt {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            awaits: Awaits::FreeText,
        }
    }

    pub fn choice<I, S>(content: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content: content.into(),
            awaits: Awaits::ChoiceSet {
                options: options.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            awaits: Awaits::Nothing,
        }
    }

    pub fn returned_to_top() -> Self {
        Self::notice("Okay, cancelled. You're back at the main menu.")
    }

    pub fn no_active_flow() -> Self {
        Self::choice(
            "There's nothing in progress. What would you like to start?",
            FlowId::ALL.map(FlowId::as_str),
        )
    }

    pub fn try_again_later() -> Self {
        Self::notice("Sorry, I couldn't save that right now. Please try again in a moment.")
    }

    pub fn out_of_date() -> Self {
        Self::notice("That answer arrived after things moved on, so it was not applied.")
    }

    pub fn internal_error() -> Self {
        Self::notice("Something went wrong on our side. Please cancel and start again.")
    }

    /// Address this prompt to a user and channel
    pub fn addressed(self, user_id: &str, channel_id: &str) -> OutboundPrompt {
        OutboundPrompt {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            rendered_content: self.content,
            awaits: self.awaits,
        }
    }
}

/// Prompt handed to the transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPrompt {
    pub user_id: String,
    pub channel_id: String,
    pub rendered_content: String,
    pub awaits: Awaits,
}
