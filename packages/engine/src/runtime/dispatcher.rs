// packages/engine/src/runtime/dispatcher.rs
//! Dispatch engine
//!
//! Owns the task queue, the worker pool and the single dispatch loop that
//! moves tasks between them:
//!
//! ```text
//! submit ──► TaskQueue ──► dispatch loop ──► wait for a slot ──► WorkerPool
//!   │ full: QueueFull          │ no agent: NoAgentAvailable          │
//!   │ no agent: NoAgentAvailable                                     ▼
//! TaskHandle ◄──────────────── outcome (exactly once) ◄──── ProcessManager
//! ```
//!
//! A task nobody can run is answered as soon as that is known, at admission
//! or right after it is dequeued; only tasks with a matching agent wait for
//! a worker slot. The loop is the only consumer of the queue and the only
//! caller of [`WorkerPool::assign`], so ordering and slot accounting are
//! decided in one place.

use super::process_manager::ProcessManager;
use super::selector::{self, LoadTracker};
use super::task::{Task, TaskHandle, TaskResult, TaskSpec, TaskState};
use super::task_queue::{QueueStats, TaskQueue};
use super::worker_pool::{Assignment, PoolStats, WorkerPool};
use crate::cache::ContextCache;
use crate::observability::{QUEUE_DEPTH, TASKS_REJECTED, TASKS_SUBMITTED};
use crate::registry::Registry;
use crate::utils::config::DispatchConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// What [`DispatchEngine::shutdown`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks answered with `ShuttingDown`
    pub drained_queued: usize,
    /// Whether running tasks had to be cancelled after the drain timeout
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub accepting: bool,
    pub queue: QueueStats,
    pub pool: PoolStats,
    /// In-flight tasks per agent
    pub agent_load: BTreeMap<String, usize>,
}

struct Shared {
    config: DispatchConfig,
    registry: Arc<Registry>,
    cache: Arc<ContextCache>,
    queue: TaskQueue<Task>,
    pool: Arc<WorkerPool>,
    load: Arc<LoadTracker>,

    /// Admission gate; flipped under the write lock so no push lands after it closes
    accepting: RwLock<bool>,

    /// Stops the dispatch loop
    stop: CancellationToken,

    /// Parent of every task's token; cancelled to force running tasks down
    abort: CancellationToken,
}

/// Accepts tasks and runs them on selected agents
pub struct DispatchEngine {
    shared: Arc<Shared>,
    dispatch_loop: Mutex<Option<JoinHandle<usize>>>,
}

impl DispatchEngine {
    /// Build the engine and start its dispatch loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: DispatchConfig, registry: Arc<Registry>, cache: Arc<ContextCache>) -> Self {
        let executor = ProcessManager::new(config.kill_grace());
        let results_cache = config.cache_task_output.then(|| Arc::clone(&cache));
        let pool = WorkerPool::new(&config, executor, results_cache);

        let shared = Arc::new(Shared {
            queue: TaskQueue::new(config.queue_capacity),
            pool,
            load: LoadTracker::new(),
            accepting: RwLock::new(true),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            config,
            registry,
            cache,
        });

        let dispatch_loop = tokio::spawn(Arc::clone(&shared).run());
        info!(
            "Dispatch engine started (queue {}, workers {})",
            shared.config.queue_capacity, shared.config.max_workers
        );

        Self {
            shared,
            dispatch_loop: Mutex::new(Some(dispatch_loop)),
        }
    }

    /// Enqueue a task and return a handle to its outcome
    ///
    /// Fails immediately with `NoAgentAvailable` when no registered agent
    /// covers the required capabilities, with `QueueFull` when the queue is
    /// at capacity and with `ShuttingDown` once shutdown has begun.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let accepting = self.shared.accepting.read();
        if !*accepting {
            return Err(EngineError::ShuttingDown);
        }

        let id = spec.id.clone().unwrap_or_else(|| Ulid::new().to_string());
        let timeout = spec.timeout.unwrap_or_else(|| self.shared.config.task_timeout());
        let (mut task, handle) = Task::new(
            id,
            spec,
            timeout,
            self.shared.config.kill_grace(),
            self.shared.abort.child_token(),
        );
        metrics::counter!(TASKS_SUBMITTED).increment(1);

        if !self.shared.has_candidate(&task) {
            let capabilities = task.capabilities.iter().cloned().collect();
            let error = self.shared.no_agent(&task);
            task.reject(error);
            return Err(EngineError::NoAgentAvailable { capabilities });
        }

        task.advance(TaskState::Queued);
        match self.shared.queue.push(task) {
            Ok(()) => {
                metrics::gauge!(QUEUE_DEPTH).set(self.shared.queue.len() as f64);
                debug!(task_id = %handle.id(), "Task queued");
                Ok(handle)
            }
            Err(task) => {
                let capacity = self.shared.queue.capacity();
                metrics::counter!(TASKS_REJECTED, "reason" => "queue_full").increment(1);
                debug!(task_id = %task.id, capacity, "Queue full, rejecting task");
                task.reject(EngineError::QueueFull { capacity });
                Err(EngineError::QueueFull { capacity })
            }
        }
    }

    /// Submit and wait for the outcome
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskResult> {
        self.submit(spec)?.wait().await
    }

    /// Submit and wait, cancelling the task if `cancel` fires first
    pub async fn submit_task_with_cancel(
        &self,
        spec: TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        self.submit(spec)?.wait_with_cancel(cancel).await
    }

    pub fn is_running(&self) -> bool {
        *self.shared.accepting.read() && !self.shared.stop.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.shared.cache
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            accepting: *self.shared.accepting.read(),
            queue: self.shared.queue.stats(),
            pool: self.shared.pool.stats(),
            agent_load: self.shared.load.snapshot(),
        }
    }

    /// Stop accepting, answer queued tasks, and wait for running ones
    ///
    /// Running tasks get the configured drain timeout; whatever is still
    /// running after that is cancelled, which terminates its process.
    pub async fn shutdown(&self) -> ShutdownReport {
        *self.shared.accepting.write() = false;
        info!("Dispatch engine shutting down");

        self.shared.stop.cancel();
        let dispatch_loop = self.dispatch_loop.lock().take();
        let mut drained_queued = 0;
        if let Some(dispatch_loop) = dispatch_loop {
            match dispatch_loop.await {
                Ok(held) => drained_queued += held,
                Err(e) => warn!("Dispatch loop ended abnormally: {}", e),
            }
        }

        let queued = self.shared.queue.drain();
        drained_queued += queued.len();
        for task in queued {
            task.finish(Err(EngineError::ShuttingDown));
        }
        metrics::gauge!(QUEUE_DEPTH).set(0.0);

        self.shared.pool.close();
        let drain_timeout = self.shared.config.drain_timeout();
        let forced = match tokio::time::timeout(drain_timeout, self.shared.pool.wait()).await {
            Ok(()) => false,
            Err(_) => {
                warn!(
                    "Running tasks did not finish within {:?}, cancelling them",
                    drain_timeout
                );
                self.shared.abort.cancel();
                self.shared.pool.wait().await;
                true
            }
        };

        info!(drained_queued, forced, "Dispatch engine stopped");
        ShutdownReport {
            drained_queued,
            forced,
        }
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shared.stop.cancel();
        self.shared.abort.cancel();
    }
}

impl Shared {
    /// Returns how many dequeued tasks were answered `ShuttingDown` on the way out
    async fn run(self: Arc<Self>) -> usize {
        debug!("Dispatch loop started");
        let mut held = 0;
        loop {
            let mut task = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                task = self.queue.pop() => task,
            };
            metrics::gauge!(QUEUE_DEPTH).set(self.queue.len() as f64);
            task.advance(TaskState::Selecting);

            if !self.has_candidate(&task) {
                let error = self.no_agent(&task);
                task.finish(Err(error));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Err(EngineError::ShuttingDown),
                _ = task.cancel.cancelled() => Err(EngineError::Cancelled),
                _ = tokio::time::sleep_until(task.deadline) => {
                    Err(EngineError::Timeout { after: task.timeout })
                }
                permit = self.pool.reserve() => permit,
            };

            match permit {
                Ok(permit) => self.dispatch(task, permit),
                Err(EngineError::ShuttingDown) => {
                    task.finish(Err(EngineError::ShuttingDown));
                    held += 1;
                    break;
                }
                Err(error) => {
                    debug!(parent: &task.span, %error, "Task ended while waiting for a worker");
                    task.finish(Err(error));
                }
            }
        }
        debug!("Dispatch loop stopped");
        held
    }

    /// Whether any registered agent covers the task's capabilities
    fn has_candidate(&self, task: &Task) -> bool {
        self.registry
            .list()
            .iter()
            .any(|agent| agent.covers(&task.capabilities))
    }

    fn no_agent(&self, task: &Task) -> EngineError {
        let capabilities: Vec<String> = task.capabilities.iter().cloned().collect();
        debug!(parent: &task.span, ?capabilities, "No agent covers the required capabilities");
        metrics::counter!(TASKS_REJECTED, "reason" => "no_agent_available").increment(1);
        EngineError::NoAgentAvailable { capabilities }
    }

    /// Select an agent for `task` and hand it to the pool
    ///
    /// Dropping `permit` on an early return gives the slot back.
    fn dispatch(&self, mut task: Task, permit: OwnedSemaphorePermit) {
        let _span = task.span.clone().entered();

        let candidates = self.registry.list();
        let Some(agent) = selector::select(&candidates, &task.capabilities, &self.load) else {
            // deregistered while the task waited for a slot
            let error = self.no_agent(&task);
            task.finish(Err(error));
            return;
        };

        task.span.record("agent_id", agent.id.as_str());
        let load = self.load.acquire(&agent.id);
        task.advance(TaskState::Dispatched);
        debug!(agent_id = %agent.id, "Task dispatched");

        self.pool.assign(Assignment {
            task,
            agent,
            load,
            permit,
        });
    }
}
