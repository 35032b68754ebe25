//! Trait abstractions for runtime I/O
//!
//! These traits let the conversation machine and the generation coordinator
//! run against mock implementations in tests.

use crate::db::{Database, DbError, FlowCount};
use crate::generation::GenerationJob;
use crate::state_machine::ConversationState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by a state store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The stored epoch differs from the writer's observed epoch
    #[error("Concurrent modification for user {user_id}")]
    ConcurrentModification { user_id: String },
    /// Stored data could not be decoded
    #[error("Corrupt state: {0}")]
    Corrupt(String),
    /// Transient backend failure; worth retrying
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ConcurrentModification { user_id, .. } => {
                StoreError::ConcurrentModification { user_id }
            }
            DbError::Corrupt { .. } => StoreError::Corrupt(err.to_string()),
            DbError::Sqlite(_) | DbError::LockPoisoned => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Storage for the per-user conversation state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state, or `None` when the user has no active flow
    async fn load(&self, user_id: &str) -> Result<Option<ConversationState>, StoreError>;

    /// Epoch-checked upsert; returns the new epoch
    async fn save(&self, state: &ConversationState) -> Result<u64, StoreError>;

    /// Delete the user's state; idempotent
    async fn clear(&self, user_id: &str) -> Result<(), StoreError>;

    /// Delete states not updated since `cutoff`
    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn count_active_by_flow(&self) -> Result<Vec<FlowCount>, StoreError>;

    async fn list_states(&self) -> Result<Vec<ConversationState>, StoreError>;
}

/// Starts background generation jobs
pub trait GenerationLauncher: Send + Sync {
    /// Hand a job off; must not block the caller
    fn launch(&self, job: GenerationJob);
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn load(&self, user_id: &str) -> Result<Option<ConversationState>, StoreError> {
        (**self).load(user_id).await
    }

    async fn save(&self, state: &ConversationState) -> Result<u64, StoreError> {
        (**self).save(state).await
    }

    async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        (**self).clear(user_id).await
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).sweep_stale(cutoff).await
    }

    async fn count_active_by_flow(&self) -> Result<Vec<FlowCount>, StoreError> {
        (**self).count_active_by_flow().await
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, StoreError> {
        (**self).list_states().await
    }
}

impl<T: GenerationLauncher + ?Sized> GenerationLauncher for Arc<T> {
    fn launch(&self, job: GenerationJob) {
        (**self).launch(job);
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a `StateStore`
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run a blocking database call off the async executor
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, DbError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Storage task failed: {e}")))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl StateStore for DatabaseStorage {
    async fn load(&self, user_id: &str) -> Result<Option<ConversationState>, StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.load_state(&user_id)).await
    }

    async fn save(&self, state: &ConversationState) -> Result<u64, StoreError> {
        let state = state.clone();
        self.blocking(move |db| db.save_state(&state)).await
    }

    async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.clear_state(&user_id).map(|_| ()))
            .await
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.blocking(move |db| db.sweep_stale(cutoff)).await
    }

    async fn count_active_by_flow(&self) -> Result<Vec<FlowCount>, StoreError> {
        self.blocking(Database::count_active_by_flow).await
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, StoreError> {
        self.blocking(Database::list_states).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{FlowContext, FlowId, Step};

    #[tokio::test]
    async fn test_database_storage_maps_conflicts() {
        let store = DatabaseStorage::new(Database::open_in_memory().unwrap());
        let state = ConversationState::new(
            "u1",
            "c1",
            Step::AskDays,
            FlowContext::empty(FlowId::MealPlan),
        );
        assert_eq!(store.save(&state).await.unwrap(), 1);
        assert_eq!(
            store.save(&state).await.unwrap_err(),
            StoreError::ConcurrentModification {
                user_id: "u1".to_string()
            }
        );
        store.clear("u1").await.unwrap();
        store.clear("u1").await.unwrap();
        assert!(store.load("u1").await.unwrap().is_none());
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("locked".to_string()).is_transient());
        assert!(!StoreError::Corrupt("bad".to_string()).is_transient());
        assert!(!StoreError::ConcurrentModification {
            user_id: "u1".to_string()
        }
        .is_transient());
    }
}
