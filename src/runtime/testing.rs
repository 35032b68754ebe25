//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::db::FlowCount;
use crate::generation::GenerationJob;
use crate::llm::{GenerationRequest, GenerativeService, LlmError};
use crate::state_machine::{ConversationState, FlowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Default)]
struct Rows {
    states: HashMap<String, ConversationState>,
    watermarks: HashMap<String, u64>,
}

impl Rows {
    fn write(&mut self, state: &ConversationState) -> u64 {
        let stored = self.states.get(&state.user_id).map_or(0, |s| s.epoch);
        let watermark = self.watermarks.get(&state.user_id).copied().unwrap_or(0);
        let epoch = stored.max(watermark) + 1;
        let mut row = state.clone();
        row.epoch = epoch;
        self.states.insert(state.user_id.clone(), row);
        self.watermarks.insert(state.user_id.clone(), epoch);
        epoch
    }
}

/// In-memory state store with the same epoch rules as the database
#[allow(dead_code)]
pub struct InMemoryStorage {
    rows: Mutex<Rows>,
    /// Written unconditionally right before the next `save`, simulating a
    /// concurrent writer that wins the race
    interleaved: Mutex<Option<ConversationState>>,
    saves: AtomicU32,
}

#[allow(dead_code)]
impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Rows::default()),
            interleaved: Mutex::new(None),
            saves: AtomicU32::new(0),
        }
    }

    /// Current row for a user, bypassing the async interface
    pub fn get(&self, user_id: &str) -> Option<ConversationState> {
        self.rows.lock().unwrap().states.get(user_id).cloned()
    }

    /// Synchronous clear, usable from non-async test hooks
    pub fn clear_now(&self, user_id: &str) {
        self.rows.lock().unwrap().states.remove(user_id);
    }

    /// Force-write `state` before the next `save` is checked
    pub fn interleave_write(&self, state: ConversationState) {
        *self.interleaved.lock().unwrap() = Some(state);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStorage {
    async fn load(&self, user_id: &str) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.get(user_id))
    }

    async fn save(&self, state: &ConversationState) -> Result<u64, StoreError> {
        let interleaved = self.interleaved.lock().unwrap().take();
        let mut rows = self.rows.lock().unwrap();
        if let Some(other) = interleaved {
            rows.write(&other);
        }

        let stored = rows.states.get(&state.user_id).map_or(0, |s| s.epoch);
        if stored != state.epoch {
            return Err(StoreError::ConcurrentModification {
                user_id: state.user_id.clone(),
            });
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(rows.write(state))
    }

    async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        self.clear_now(user_id);
        Ok(())
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.states.len();
        rows.states.retain(|_, state| state.updated_at >= cutoff);
        Ok(before - rows.states.len())
    }

    async fn count_active_by_flow(&self) -> Result<Vec<FlowCount>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut counts: Vec<FlowCount> = FlowId::ALL
            .into_iter()
            .map(|flow| FlowCount {
                flow,
                active: rows.states.values().filter(|s| s.flow == flow).count() as u64,
            })
            .filter(|count| count.active > 0)
            .collect();
        counts.sort_by_key(|c| c.flow.as_str());
        Ok(counts)
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, StoreError> {
        let mut states: Vec<_> = self.rows.lock().unwrap().states.values().cloned().collect();
        states.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(states)
    }
}

// ============================================================================
// Flaky Storage
// ============================================================================

/// Wraps `InMemoryStorage` and fails the next N calls as unavailable
#[allow(dead_code)]
pub struct FlakyStorage {
    pub inner: InMemoryStorage,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

#[allow(dead_code)]
impl FlakyStorage {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryStorage::new(),
            failures_remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Unavailable("database is locked".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for FlakyStorage {
    async fn load(&self, user_id: &str) -> Result<Option<ConversationState>, StoreError> {
        self.trip()?;
        self.inner.load(user_id).await
    }

    async fn save(&self, state: &ConversationState) -> Result<u64, StoreError> {
        self.trip()?;
        self.inner.save(state).await
    }

    async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.clear(user_id).await
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.trip()?;
        self.inner.sweep_stale(cutoff).await
    }

    async fn count_active_by_flow(&self) -> Result<Vec<FlowCount>, StoreError> {
        self.trip()?;
        self.inner.count_active_by_flow().await
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, StoreError> {
        self.trip()?;
        self.inner.list_states().await
    }
}

// ============================================================================
// Recording Launcher
// ============================================================================

/// Launcher that records jobs instead of running them
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingLauncher {
    jobs: Mutex<Vec<GenerationJob>>,
}

#[allow(dead_code)]
impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl GenerationLauncher for RecordingLauncher {
    fn launch(&self, job: GenerationJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

// ============================================================================
// Scripted Generative Service
// ============================================================================

enum Scripted {
    Output(String),
    Error(LlmError),
    /// Sleep, then fail; meant to be cut off by the attempt timeout
    Delay(Duration),
}

type CallHook = Box<dyn FnOnce() + Send>;

/// Generative service that replays queued responses in order
#[allow(dead_code)]
pub struct ScriptedGenerativeService {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<GenerationRequest>>,
    hooks: Mutex<HashMap<usize, CallHook>>,
}

#[allow(dead_code)]
impl ScriptedGenerativeService {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hooks: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue_output(&self, output: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Output(output.into()));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.script.lock().unwrap().push_back(Scripted::Error(error));
    }

    pub fn queue_delay(&self, delay: Duration) {
        self.script.lock().unwrap().push_back(Scripted::Delay(delay));
    }

    /// Run `hook` during the `call`-th request (1-based)
    pub fn on_call(&self, call: usize, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().unwrap().insert(call, Box::new(hook));
    }

    pub fn recorded_requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for ScriptedGenerativeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerativeService for ScriptedGenerativeService {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let hook = self.hooks.lock().unwrap().remove(&call);
        if let Some(hook) = hook {
            hook();
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Error(error)) => Err(error),
            Some(Scripted::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Err(LlmError::network("Scripted delay elapsed"))
            }
            None => Err(LlmError::unknown("No scripted response queued")),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
