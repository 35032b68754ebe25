//! Conversation machine
//!
//! Executes the pure transition for one inbound event: load, transition,
//! epoch-checked persist, then effects. Concurrent modifications are
//! reconciled by reloading; transient store failures are retried.

use super::traits::{GenerationLauncher, StateStore, StoreError};
use crate::flows::FlowRegistry;
use crate::generation::GenerationJob;
use crate::state_machine::{
    transition, ConversationState, Effect, FlowId, InboundEvent, OutboundPrompt, Prompt,
    RoutingKey, StateChange, Step, TransitionError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How often an event is re-applied after losing a write race
const MAX_RECONCILE_ATTEMPTS: u32 = 3;

// ============================================================================
// Store Retry
// ============================================================================

/// Bounded retry with exponential backoff for transient store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl StoreRetry {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no backoff
    #[allow(dead_code)] // Used in tests
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis(), "Retrying store operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

// ============================================================================
// Machine
// ============================================================================

#[derive(Debug, Error)]
pub enum MachineError {
    /// The stored position has no handler; never swallowed
    #[error("Transition failed for user {user_id}: {source}")]
    Transition {
        user_id: String,
        channel_id: String,
        #[source]
        source: TransitionError,
    },
}

impl MachineError {
    /// Neutral notice for the affected user
    pub fn notice(&self) -> OutboundPrompt {
        match self {
            MachineError::Transition {
                user_id,
                channel_id,
                ..
            } => Prompt::internal_error().addressed(user_id, channel_id),
        }
    }
}

type Position = Option<(FlowId, Step)>;

fn position(state: Option<&ConversationState>) -> Position {
    state.map(|s| (s.flow, s.step))
}

/// Foreground executor, shared by every per-user worker
pub struct ConversationMachine {
    registry: Arc<FlowRegistry>,
    store: Arc<dyn StateStore>,
    launcher: Arc<dyn GenerationLauncher>,
    retry: StoreRetry,
}

impl ConversationMachine {
    pub fn new(
        registry: Arc<FlowRegistry>,
        store: Arc<dyn StateStore>,
        launcher: Arc<dyn GenerationLauncher>,
        retry: StoreRetry,
    ) -> Self {
        Self {
            registry,
            store,
            launcher,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Process one event and return the prompts for the user.
    ///
    /// Events for the same user must not be processed concurrently; the
    /// runtime manager serializes them.
    pub async fn handle(&self, event: &InboundEvent) -> Result<Vec<OutboundPrompt>, MachineError> {
        let Some(key) = event.routing_key() else {
            tracing::debug!(event_id = %event.event_id, "Dropping unaddressable event");
            return Ok(vec![]);
        };

        let mut first_seen: Option<Position> = None;
        let mut reconciles = 0;

        loop {
            // Cancel must not depend on reading the current state
            let current = if event.is_cancel() {
                None
            } else {
                match self.retry.run(|| self.store.load(&key.user_id)).await {
                    Ok(state) => state,
                    Err(e) => return Ok(self.store_failed(&key, &e)),
                }
            };

            let seen = position(current.as_ref());
            if first_seen.is_some_and(|first| first != seen) {
                tracing::info!(
                    user_id = %key.user_id,
                    event_id = %event.event_id,
                    "State moved on before the event could be applied"
                );
                return Ok(vec![Prompt::out_of_date().addressed(&key.user_id, &key.channel_id)]);
            }

            let result = transition(&self.registry, current.as_ref(), event, &key).map_err(
                |source| {
                    tracing::error!(
                        user_id = %key.user_id,
                        flow = ?seen.map(|(flow, _)| flow),
                        step = ?seen.map(|(_, step)| step),
                        error = %source,
                        "No handler for stored position"
                    );
                    MachineError::Transition {
                        user_id: key.user_id.clone(),
                        channel_id: key.channel_id.clone(),
                        source,
                    }
                },
            )?;

            let flow = match &result.change {
                StateChange::Save(state) => Some(state.flow),
                StateChange::Unchanged | StateChange::Clear => None,
            };

            match self.persist(&key, &result.change).await {
                Ok(epoch) => {
                    tracing::info!(
                        user_id = %key.user_id,
                        event_id = %event.event_id,
                        from = ?seen,
                        epoch = ?epoch,
                        "Processed event"
                    );
                    return Ok(self.run_effects(&key, flow, epoch, result.effects));
                }
                Err(StoreError::ConcurrentModification { .. })
                    if reconciles < MAX_RECONCILE_ATTEMPTS =>
                {
                    reconciles += 1;
                    first_seen.get_or_insert(seen);
                    tracing::debug!(
                        user_id = %key.user_id,
                        event_id = %event.event_id,
                        reconciles,
                        "Lost a write race, reloading"
                    );
                }
                Err(StoreError::ConcurrentModification { .. }) => {
                    return Ok(vec![Prompt::out_of_date().addressed(&key.user_id, &key.channel_id)]);
                }
                Err(e) => return Ok(self.store_failed(&key, &e)),
            }
        }
    }

    /// Apply a state change; returns the new epoch for saves
    async fn persist(&self, key: &RoutingKey, change: &StateChange) -> Result<Option<u64>, StoreError> {
        match change {
            StateChange::Unchanged => Ok(None),
            StateChange::Save(state) => self.retry.run(|| self.store.save(state)).await.map(Some),
            StateChange::Clear => {
                self.retry.run(|| self.store.clear(&key.user_id)).await?;
                Ok(None)
            }
        }
    }

    fn run_effects(
        &self,
        key: &RoutingKey,
        flow: Option<FlowId>,
        epoch: Option<u64>,
        effects: Vec<Effect>,
    ) -> Vec<OutboundPrompt> {
        let mut prompts = Vec::new();
        for effect in effects {
            match effect {
                Effect::Prompt(prompt) => {
                    prompts.push(prompt.addressed(&key.user_id, &key.channel_id));
                }
                Effect::LaunchGeneration(input) => match (flow, epoch) {
                    (Some(flow), Some(epoch)) => {
                        self.launcher.launch(GenerationJob::new(
                            &key.user_id,
                            &key.channel_id,
                            flow,
                            epoch,
                            input,
                        ));
                    }
                    _ => {
                        tracing::error!(user_id = %key.user_id, "Generation requested without a saved state");
                    }
                },
            }
        }
        prompts
    }

    fn store_failed(&self, key: &RoutingKey, error: &StoreError) -> Vec<OutboundPrompt> {
        tracing::error!(
            user_id = %key.user_id,
            error = %error,
            attempts = self.retry.attempts,
            "Store unavailable, event not applied"
        );
        vec![Prompt::try_again_later().addressed(&key.user_id, &key.channel_id)]
    }
}
