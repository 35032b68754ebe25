//! Startup recovery report
//!
//! All state lives in the store, so nothing needs rebuilding after a
//! restart. Users parked in an awaiting-generation step stay there: they get
//! a "please wait" prompt on their next event, and a parked state older than
//! the stall threshold relaunches its job. This report makes that backlog
//! visible in the logs.

use super::traits::{StateStore, StoreError};
use crate::db::FlowCount;
use crate::flows::generation_stalled;
use crate::state_machine::ConversationState;
use chrono::{DateTime, Utc};

/// Snapshot of stored conversations at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub active: Vec<FlowCount>,
    /// Users parked while a generation job was outstanding
    pub awaiting: Vec<String>,
    /// Parked users whose job will be relaunched on their next event
    pub stalled: Vec<String>,
}

impl RecoveryReport {
    pub fn total_active(&self) -> u64 {
        self.active.iter().map(|c| c.active).sum()
    }

    pub fn log(&self) {
        tracing::info!(
            active = self.total_active(),
            by_flow = ?self.active,
            awaiting = self.awaiting.len(),
            stalled = self.stalled.len(),
            "Recovered conversation state"
        );
        for user_id in &self.stalled {
            tracing::info!(user_id = %user_id, "Parked generation looks stalled, relaunching on next event");
        }
    }
}

/// Whether a parked state has waited past the stall threshold
pub fn is_stalled(state: &ConversationState, now: DateTime<Utc>) -> bool {
    if !state.step.is_awaiting_generation() {
        return false;
    }
    generation_stalled(
        state.meal_plan().and_then(|ctx| ctx.generation_requested_at),
        now,
    )
}

pub async fn recovery_report(
    store: &dyn StateStore,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, StoreError> {
    let active = store.count_active_by_flow().await?;
    let states = store.list_states().await?;

    let parked: Vec<&ConversationState> = states
        .iter()
        .filter(|s| s.step.is_awaiting_generation())
        .collect();

    Ok(RecoveryReport {
        active,
        awaiting: parked.iter().map(|s| s.user_id.clone()).collect(),
        stalled: parked
            .iter()
            .filter(|s| is_stalled(s, now))
            .map(|s| s.user_id.clone())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::InMemoryStorage;
    use crate::state_machine::{FlowContext, FlowId, MealPlanContext, Step};
    use chrono::Duration;

    fn parked(user: &str, requested_at: DateTime<Utc>) -> ConversationState {
        ConversationState::new(
            user,
            "c1",
            Step::GeneratingDraft,
            FlowContext::MealPlan(MealPlanContext {
                generation_requested_at: Some(requested_at),
                ..MealPlanContext::default()
            }),
        )
    }

    #[test]
    fn test_only_old_parked_states_are_stalled() {
        let now = Utc::now();
        assert!(is_stalled(&parked("u1", now - Duration::minutes(30)), now));
        assert!(!is_stalled(&parked("u1", now - Duration::minutes(1)), now));

        let asking = ConversationState::new(
            "u2",
            "c1",
            Step::AskDays,
            FlowContext::empty(FlowId::MealPlan),
        );
        assert!(!is_stalled(&asking, now + Duration::days(1)));
    }

    #[test]
    fn test_parked_without_request_time_is_stalled() {
        let fresh = ConversationState::new(
            "u1",
            "c1",
            Step::GeneratingDraft,
            FlowContext::empty(FlowId::MealPlan),
        );
        assert!(is_stalled(&fresh, fresh.updated_at));
    }

    #[tokio::test]
    async fn test_report_counts_flows_and_parked_users() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        store.save(&parked("u1", now - Duration::hours(1))).await.unwrap();
        store.save(&parked("u2", now)).await.unwrap();
        store
            .save(&ConversationState::new(
                "u3",
                "c1",
                Step::AskName,
                FlowContext::empty(FlowId::Onboarding),
            ))
            .await
            .unwrap();

        let report = recovery_report(&store, now).await.unwrap();
        assert_eq!(report.total_active(), 3);
        assert_eq!(report.awaiting, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(report.stalled, vec!["u1".to_string()]);
    }
}
