//! Generation coordinator
//!
//! Runs one background task per job: call the generative service, validate
//! through the guardrail pipeline, retry with reinforcement, and finally
//! apply a single outcome through the epoch-checked `OutcomeWriter`.

use crate::flows::FlowRegistry;
use crate::guardrails::{GuardrailPipeline, TripwireReason};
use crate::llm::{GenerationRequest, GenerativeService, LlmErrorKind};
use crate::runtime::{GenerationLauncher, StateStore, StoreError, StoreRetry};
use crate::state_machine::{
    resolve_generation, FlowId, GenerationApply, GenerationInput, OutboundPrompt, StaleReason,
    Step, TransitionError,
};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One background job, tagged with the epoch of the write that parked the
/// user in the awaiting step
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub channel_id: String,
    pub flow: FlowId,
    pub epoch: u64,
    pub input: GenerationInput,
}

impl GenerationJob {
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        flow: FlowId,
        epoch: u64,
        input: GenerationInput,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            flow,
            epoch,
            input,
        }
    }
}

/// Why a job gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalFailure {
    /// Every attempt was rejected by a guardrail; carries the last reason
    GuardrailsExhausted { reason: TripwireReason },
    /// The timeout budget ran out
    TimedOut,
    /// The service failed non-retryably, or retryable failures ran out
    ServiceFailed { kind: LlmErrorKind, message: String },
}

impl FinalFailure {
    /// Short neutral summary, safe to persist in context
    pub fn summary(&self) -> String {
        match self {
            FinalFailure::GuardrailsExhausted { reason } => format!("guardrails_exhausted:{reason}"),
            FinalFailure::TimedOut => "timed_out".to_string(),
            FinalFailure::ServiceFailed { kind, .. } => format!("service_failed:{}", kind.as_str()),
        }
    }
}

/// The single outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Succeeded { output: Value, attempts: u32 },
    Failed { failure: FinalFailure, attempts: u32 },
}

impl GenerationOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            GenerationOutcome::Succeeded { attempts, .. }
            | GenerationOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Retry ceilings and per-attempt deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationPolicy {
    /// Attempts lost to guardrail rejections or retryable service errors
    pub max_attempts: u32,
    /// Attempts lost to timeouts, counted separately
    pub timeout_budget: u32,
    pub attempt_timeout: Duration,
    /// Base delay before retrying a retryable service error
    pub backoff: Duration,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_budget: 3,
            attempt_timeout: Duration::from_secs(60),
            backoff: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Outcome Writer
// ============================================================================

#[derive(Debug, Error)]
pub enum OutcomeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What happened to an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied { step: Step },
    Discarded(StaleReason),
}

/// The only write capability a job holds: apply its outcome if, and only
/// if, the stored epoch still matches the job's
#[derive(Clone)]
pub struct OutcomeWriter {
    store: Arc<dyn StateStore>,
    registry: Arc<FlowRegistry>,
    prompts: broadcast::Sender<OutboundPrompt>,
    retry: StoreRetry,
}

impl OutcomeWriter {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<FlowRegistry>,
        prompts: broadcast::Sender<OutboundPrompt>,
        retry: StoreRetry,
    ) -> Self {
        Self {
            store,
            registry,
            prompts,
            retry,
        }
    }

    /// Whether the job's epoch is still the stored one
    pub async fn is_current(&self, job: &GenerationJob) -> bool {
        match self.retry.run(|| self.store.load(&job.user_id)).await {
            Ok(Some(state)) => state.epoch == job.epoch,
            Ok(None) => false,
            // Unknown; keep working and let the final write decide
            Err(_) => true,
        }
    }

    pub async fn apply(
        &self,
        job: &GenerationJob,
        outcome: &GenerationOutcome,
    ) -> Result<ApplyResult, OutcomeError> {
        let current = self.retry.run(|| self.store.load(&job.user_id)).await?;
        let decision =
            resolve_generation(&self.registry, current.as_ref(), job.flow, job.epoch, outcome)?;

        let (state, prompt) = match decision {
            GenerationApply::Apply { state, prompt } => (state, prompt),
            GenerationApply::Discard(reason) => {
                tracing::debug!(
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    epoch = job.epoch,
                    reason = ?reason,
                    "Discarding stale generation outcome"
                );
                return Ok(ApplyResult::Discarded(reason));
            }
        };

        match self.retry.run(|| self.store.save(&state)).await {
            Ok(epoch) => {
                tracing::info!(
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    flow = %job.flow,
                    step = %state.step,
                    epoch,
                    attempts = outcome.attempts(),
                    "Applied generation outcome"
                );
                let _ = self
                    .prompts
                    .send(prompt.addressed(&state.user_id, &state.channel_id));
                Ok(ApplyResult::Applied { step: state.step })
            }
            // Lost the race between our load and save
            Err(StoreError::ConcurrentModification { .. }) => {
                tracing::debug!(
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    "Generation outcome lost a concurrent write, discarding"
                );
                Ok(ApplyResult::Discarded(StaleReason::Superseded))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Launches and runs generation jobs
#[derive(Clone)]
pub struct GenerationCoordinator {
    service: Arc<dyn GenerativeService>,
    pipeline: Arc<GuardrailPipeline>,
    policy: GenerationPolicy,
    writer: OutcomeWriter,
}

impl GenerationCoordinator {
    pub fn new(
        service: Arc<dyn GenerativeService>,
        pipeline: Arc<GuardrailPipeline>,
        policy: GenerationPolicy,
        writer: OutcomeWriter,
    ) -> Self {
        Self {
            service,
            pipeline,
            policy,
            writer,
        }
    }

    /// Run a job to its single outcome and apply it.
    pub async fn execute(&self, job: GenerationJob) -> Result<Option<ApplyResult>, OutcomeError> {
        let Some(outcome) = self.run(&job).await else {
            return Ok(None);
        };
        self.writer.apply(&job, &outcome).await.map(Some)
    }

    /// Attempt loop. Returns `None` when the job was abandoned because the
    /// user moved on while it was retrying.
    pub async fn run(&self, job: &GenerationJob) -> Option<GenerationOutcome> {
        let mut request = GenerationRequest::from_input(&job.input);
        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut timeouts = 0u32;

        loop {
            if attempts > 0 && !self.writer.is_current(job).await {
                tracing::debug!(
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    attempts,
                    "Abandoning superseded generation job"
                );
                return None;
            }
            attempts += 1;

            let result =
                match tokio::time::timeout(self.policy.attempt_timeout, self.service.generate(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(crate::llm::LlmError::timeout(format!(
                        "Attempt exceeded {}s",
                        self.policy.attempt_timeout.as_secs()
                    ))),
                };

            let raw = match result {
                Ok(raw) => raw,
                Err(e) if e.kind == LlmErrorKind::Timeout => {
                    timeouts += 1;
                    tracing::warn!(
                        job_id = %job.job_id,
                        attempt = attempts,
                        timeouts,
                        "Generation attempt timed out"
                    );
                    if timeouts >= self.policy.timeout_budget {
                        return Some(GenerationOutcome::Failed {
                            failure: FinalFailure::TimedOut,
                            attempts,
                        });
                    }
                    continue;
                }
                Err(e) if !e.kind.is_retryable() => {
                    return Some(GenerationOutcome::Failed {
                        failure: FinalFailure::ServiceFailed {
                            kind: e.kind,
                            message: e.message,
                        },
                        attempts,
                    });
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        job_id = %job.job_id,
                        attempt = attempts,
                        kind = e.kind.as_str(),
                        error = %e,
                        "Generation attempt failed"
                    );
                    if failures >= self.policy.max_attempts {
                        return Some(GenerationOutcome::Failed {
                            failure: FinalFailure::ServiceFailed {
                                kind: e.kind,
                                message: e.message,
                            },
                            attempts,
                        });
                    }
                    tokio::time::sleep(self.backoff(failures, e.retry_after)).await;
                    continue;
                }
            };

            let report = self.pipeline.evaluate(&raw, &job.input.constraints).await;
            if let Some(output) = report.output {
                tracing::info!(job_id = %job.job_id, attempt = attempts, "Generation accepted");
                return Some(GenerationOutcome::Succeeded { output, attempts });
            }

            let Some(tripwire) = report.first_failure() else {
                // A report without output always carries a failure
                return Some(GenerationOutcome::Failed {
                    failure: FinalFailure::GuardrailsExhausted {
                        reason: TripwireReason::MalformedOutput,
                    },
                    attempts,
                });
            };
            failures += 1;
            tracing::info!(
                job_id = %job.job_id,
                attempt = attempts,
                reason = %tripwire.reason,
                detail = ?tripwire.detail,
                "Guardrail rejected generation"
            );
            if failures >= self.policy.max_attempts {
                return Some(GenerationOutcome::Failed {
                    failure: FinalFailure::GuardrailsExhausted {
                        reason: tripwire.reason,
                    },
                    attempts,
                });
            }
            request = request.reinforced(tripwire.reinforcement());
        }
    }

    /// Server hint if given, else exponential with up to 25% jitter
    fn backoff(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(MAX_BACKOFF);
        }
        let base = self
            .policy
            .backoff
            .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)));
        let jitter_ms = u64::try_from(base.as_millis() / 4).unwrap_or(0);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        base.saturating_add(jitter).min(MAX_BACKOFF)
    }
}

impl GenerationLauncher for GenerationCoordinator {
    fn launch(&self, job: GenerationJob) {
        tracing::info!(
            job_id = %job.job_id,
            user_id = %job.user_id,
            flow = %job.flow,
            epoch = job.epoch,
            "Launching generation job"
        );
        let coordinator = self.clone();
        tokio::spawn(async move {
            let job_id = job.job_id;
            if let Err(e) = coordinator.execute(job).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to apply generation outcome");
            }
        });
    }
}
