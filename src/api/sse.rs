//! Server-Sent Events support

use crate::state_machine::OutboundPrompt;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Convert the prompt broadcast into an SSE stream, optionally for one user
pub fn prompt_stream(
    broadcast_rx: tokio::sync::broadcast::Receiver<OutboundPrompt>,
    user_id: Option<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let prompts = BroadcastStream::new(broadcast_rx).filter_map(move |result| match result {
        Ok(prompt) if addressed_to(user_id.as_deref(), &prompt) => {
            Some(Ok(prompt_to_event(&prompt)))
        }
        Ok(_) => None,
        Err(e) => {
            // Lagged receivers skip ahead
            tracing::debug!(error = %e, "Prompt stream lagged");
            None
        }
    });

    Sse::new(prompts).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn addressed_to(filter: Option<&str>, prompt: &OutboundPrompt) -> bool {
    match filter {
        Some(user_id) => prompt.user_id == user_id,
        None => true,
    }
}

fn prompt_to_event(prompt: &OutboundPrompt) -> Event {
    let data = serde_json::to_string(prompt).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("prompt").data(data)
}
