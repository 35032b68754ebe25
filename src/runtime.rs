//! Runtime for processing conversations
//!
//! One ordered worker per active user, fed by a bounded queue. Workers for
//! different users run in parallel; background generation runs on its own
//! tasks and never blocks a user's queue.

mod machine;
pub mod recovery;
pub mod sweeper;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use machine::{ConversationMachine, MachineError, StoreRetry};
pub use traits::*;

use crate::state_machine::{InboundEvent, OutboundPrompt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

/// Errors returned to the transport when dispatching an event
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The user's queue is full
    #[error("Too many pending events for user {user_id}")]
    Overloaded { user_id: String },
    /// The worker stopped before replying
    #[error("Worker for user {user_id} stopped unexpectedly")]
    WorkerGone { user_id: String },
    #[error(transparent)]
    Machine(#[from] MachineError),
}

/// Per-user worker sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

type Reply = oneshot::Sender<Result<Vec<OutboundPrompt>, MachineError>>;

struct WorkItem {
    event: InboundEvent,
    reply: Reply,
}

/// Handle to a running per-user worker
struct WorkerHandle {
    id: u64,
    tx: mpsc::Sender<WorkItem>,
}

type Workers = Arc<RwLock<HashMap<String, WorkerHandle>>>;

/// Manager for all per-user workers
pub struct RuntimeManager {
    machine: Arc<ConversationMachine>,
    workers: Workers,
    prompts: broadcast::Sender<OutboundPrompt>,
    settings: WorkerSettings,
    next_worker_id: AtomicU64,
}

impl RuntimeManager {
    pub fn new(
        machine: ConversationMachine,
        prompts: broadcast::Sender<OutboundPrompt>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            machine: Arc::new(machine),
            workers: Arc::new(RwLock::new(HashMap::new())),
            prompts,
            settings,
            next_worker_id: AtomicU64::new(1),
        }
    }

    /// Submit an event and wait for the prompts it produced.
    ///
    /// Prompts are also broadcast to every subscriber.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<Vec<OutboundPrompt>, DispatchError> {
        let Some(key) = event.routing_key() else {
            tracing::debug!(event_id = %event.event_id, "Dropping unaddressable event");
            return Ok(vec![]);
        };

        let (reply, response) = oneshot::channel();
        self.enqueue(&key.user_id, WorkItem { event, reply }).await?;

        let result = response.await.map_err(|_| DispatchError::WorkerGone {
            user_id: key.user_id.clone(),
        })?;
        Ok(result?)
    }

    /// Subscribe to every outbound prompt, foreground and background
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundPrompt> {
        self.prompts.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        self.machine.store()
    }

    /// Number of live per-user workers
    pub async fn active_workers(&self) -> usize {
        self.workers.read().await.len()
    }

    async fn enqueue(&self, user_id: &str, item: WorkItem) -> Result<(), DispatchError> {
        // Fast path: existing worker, sent under the read lock so an idle
        // worker cannot retire between lookup and send
        let item = {
            let workers = self.workers.read().await;
            match workers.get(user_id) {
                Some(handle) => match handle.tx.try_send(item) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        return Err(self.overloaded(user_id));
                    }
                    Err(mpsc::error::TrySendError::Closed(item)) => item,
                },
                None => item,
            }
        };

        let mut workers = self.workers.write().await;
        let alive = workers
            .get(user_id)
            .is_some_and(|handle| !handle.tx.is_closed());
        if !alive {
            let handle = self.spawn_worker(user_id);
            workers.insert(user_id.to_string(), handle);
        }
        match workers.get(user_id) {
            Some(handle) => match handle.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(self.overloaded(user_id)),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::WorkerGone {
                    user_id: user_id.to_string(),
                }),
            },
            None => Err(DispatchError::WorkerGone {
                user_id: user_id.to_string(),
            }),
        }
    }

    fn overloaded(&self, user_id: &str) -> DispatchError {
        tracing::warn!(
            user_id = %user_id,
            capacity = self.settings.queue_capacity,
            "Rejecting event, user queue is full"
        );
        DispatchError::Overloaded {
            user_id: user_id.to_string(),
        }
    }

    fn spawn_worker(&self, user_id: &str) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let worker = Worker {
            id,
            user_id: user_id.to_string(),
            rx,
            machine: self.machine.clone(),
            workers: self.workers.clone(),
            prompts: self.prompts.clone(),
            idle_timeout: self.settings.idle_timeout,
        };
        tracing::debug!(user_id = %user_id, worker_id = id, "Starting user worker");
        tokio::spawn(worker.run());
        WorkerHandle { id, tx }
    }
}

/// Ordered event loop for one user
struct Worker {
    id: u64,
    user_id: String,
    rx: mpsc::Receiver<WorkItem>,
    machine: Arc<ConversationMachine>,
    workers: Workers,
    prompts: broadcast::Sender<OutboundPrompt>,
    idle_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => break,
                Err(_) => {
                    // Retire under the write lock: no send can race the check
                    let mut workers = self.workers.write().await;
                    if let Ok(item) = self.rx.try_recv() {
                        drop(workers);
                        self.process(item).await;
                        continue;
                    }
                    if workers.get(&self.user_id).is_some_and(|h| h.id == self.id) {
                        workers.remove(&self.user_id);
                    }
                    break;
                }
            }
        }
        tracing::debug!(user_id = %self.user_id, worker_id = self.id, "User worker stopped");
    }

    async fn process(&self, item: WorkItem) {
        let result = self.machine.handle(&item.event).await;
        match &result {
            Ok(prompts) => {
                for prompt in prompts {
                    let _ = self.prompts.send(prompt.clone());
                }
            }
            Err(e) => {
                let _ = self.prompts.send(e.notice());
            }
        }
        // The caller may have gone away; the event is applied regardless
        let _ = item.reply.send(result);
    }
}
