// packages/engine/src/runtime/worker_pool.rs
//! Bounded pool of reusable workers
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//! ├─ permits: Semaphore(max_workers)   (one per executing task)
//! ├─ idle:    [Worker1, Worker2, ...]  (parked, at most max_idle_workers)
//! └─ tracker: every spawned worker, for shutdown
//! ```
//!
//! The dispatcher reserves a permit *before* it takes a task off the queue,
//! so a task is only dequeued once a worker slot exists for it. A finished
//! worker parks itself in the idle list (if below the idle ceiling) and only
//! then returns its permit; a worker that finds the list full exits.

use super::process_manager::{ExecRequest, ProcessManager};
use super::selector::LoadGuard;
use super::task::{Task, TaskResult, TaskState};
use crate::cache::{task_key, ContextCache};
use crate::observability::ACTIVE_WORKERS;
use crate::registry::AgentDescriptor;
use crate::utils::config::DispatchConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

/// A task bound to its agent, ready to execute
pub(crate) struct Assignment {
    pub task: Task,
    pub agent: Arc<AgentDescriptor>,
    pub load: LoadGuard,
    pub permit: OwnedSemaphorePermit,
}

struct Job {
    assignment: Assignment,
    /// The receiving worker's own handle, returned to the idle list afterwards
    handle: WorkerHandle,
}

struct WorkerHandle {
    id: usize,
    tx: mpsc::Sender<Job>,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub max_idle_workers: usize,
    pub live_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub workers_spawned: usize,
}

pub struct WorkerPool {
    max_workers: usize,
    max_idle: usize,

    permits: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerHandle>>,
    closed: AtomicBool,
    tracker: TaskTracker,

    live: AtomicUsize,
    busy: AtomicUsize,
    spawned: AtomicUsize,

    executor: ProcessManager,

    /// Where successful stdout goes when output caching is on
    results_cache: Option<Arc<ContextCache>>,
}

impl WorkerPool {
    pub fn new(
        config: &DispatchConfig,
        executor: ProcessManager,
        results_cache: Option<Arc<ContextCache>>,
    ) -> Arc<Self> {
        info!(
            "Initializing worker pool: max {} workers, {} idle",
            config.max_workers, config.max_idle_workers
        );

        Arc::new(Self {
            max_workers: config.max_workers,
            max_idle: config.max_idle_workers,
            permits: Arc::new(Semaphore::new(config.max_workers)),
            idle: Mutex::new(Vec::with_capacity(config.max_idle_workers)),
            closed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            live: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            executor,
            results_cache,
        })
    }

    /// Wait for a free worker slot (backpressure for the dispatcher)
    pub async fn reserve(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Hand an assignment to an idle worker, spawning one if none is parked
    pub(crate) fn assign(self: &Arc<Self>, assignment: Assignment) {
        let parked = self.idle.lock().pop();
        let handle = match parked {
            Some(handle) => handle,
            None => self.spawn_worker(),
        };

        let tx = handle.tx.clone();
        let worker_id = handle.id;
        match tx.try_send(Job { assignment, handle }) {
            Ok(()) => debug!(worker_id, "Assigned task to worker"),
            Err(TrySendError::Closed(job)) | Err(TrySendError::Full(job)) => {
                warn!(worker_id, "Worker unavailable, spawning a replacement");
                let fresh = self.spawn_worker();
                let tx = fresh.tx.clone();
                let job = Job {
                    assignment: job.assignment,
                    handle: fresh,
                };
                // a fresh channel always has room for one job
                if tx.try_send(job).is_err() {
                    warn!("Replacement worker rejected its first job");
                }
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> WorkerHandle {
        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        self.live.fetch_add(1, Ordering::Relaxed);
        self.tracker.spawn(run_worker(Arc::clone(self), id, rx));
        debug!(worker_id = id, "Spawned worker");
        WorkerHandle { id, tx }
    }

    /// Park a worker after a job; false means the worker should exit
    fn check_in(&self, handle: WorkerHandle) -> bool {
        let mut idle = self.idle.lock();
        if self.closed.load(Ordering::Acquire) || idle.len() >= self.max_idle {
            return false;
        }
        idle.push(handle);
        true
    }

    async fn execute(&self, mut task: Task, agent: &AgentDescriptor) {
        let span = task.span.clone();
        async {
            task.advance(TaskState::Executing);
            debug!(agent_id = %agent.id, command = %task.command, "Executing task");

            let outcome = self
                .executor
                .run(ExecRequest {
                    command: &task.command,
                    args: &task.args,
                    stdin: &task.payload,
                    deadline: task.deadline,
                    cancel: &task.cancel,
                })
                .await
                .map(|output| TaskResult::from_output(&task.id, &agent.id, output));

            if let (Ok(result), Some(cache)) = (&outcome, &self.results_cache) {
                if let Err(e) = cache.set(task_key(&task.id), result.stdout.clone()) {
                    warn!("Failed to cache task output: {}", e);
                }
            }

            match &outcome {
                Ok(result) if result.is_success() => debug!("Task completed"),
                Ok(result) => debug!(exit_code = ?result.exit_code, "Task process failed"),
                Err(e) => debug!("Task ended without exit: {}", e),
            }
            task.finish(outcome);
        }
        .instrument(span)
        .await
    }

    /// Stop parking workers and release the idle ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let parked = std::mem::take(&mut *self.idle.lock());
        debug!("Releasing {} idle workers", parked.len());
        drop(parked);
        self.permits.close();
        self.tracker.close();
    }

    /// Wait for every worker to exit; only returns after [`close`](Self::close)
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            max_idle_workers: self.max_idle,
            live_workers: self.live.load(Ordering::Relaxed),
            idle_workers: self.idle.lock().len(),
            busy_workers: self.busy.load(Ordering::Relaxed),
            workers_spawned: self.spawned.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the live count however the worker exits
struct LiveGuard<'a>(&'a AtomicUsize);

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn run_worker(pool: Arc<WorkerPool>, id: usize, mut rx: mpsc::Receiver<Job>) {
    let _live = LiveGuard(&pool.live);

    while let Some(Job { assignment, handle }) = rx.recv().await {
        let Assignment {
            task,
            agent,
            load,
            permit,
        } = assignment;

        let busy = pool.busy.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(ACTIVE_WORKERS).set(busy as f64);

        pool.execute(task, &agent).await;
        drop(load);

        let busy = pool.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!(ACTIVE_WORKERS).set(busy as f64);

        let parked = pool.check_in(handle);
        drop(permit);
        if !parked {
            break;
        }
    }

    debug!(worker_id = id, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::selector::LoadTracker;
    use crate::runtime::task::{TaskHandle, TaskSpec};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn config(max_workers: usize, max_idle_workers: usize) -> DispatchConfig {
        DispatchConfig {
            max_workers,
            max_idle_workers,
            kill_grace_ms: 100,
            ..Default::default()
        }
    }

    async fn submit(
        pool: &Arc<WorkerPool>,
        load: &Arc<LoadTracker>,
        id: &str,
        spec: TaskSpec,
    ) -> TaskHandle {
        let (mut task, handle) = Task::new(
            id.to_string(),
            spec,
            Duration::from_secs(5),
            Duration::from_millis(100),
            CancellationToken::new(),
        );
        task.advance(TaskState::Queued);
        task.advance(TaskState::Selecting);
        task.advance(TaskState::Dispatched);

        let permit = pool.reserve().await.unwrap();
        let agent = Arc::new(AgentDescriptor::new("agent-1", ["shell"], "local"));
        pool.assign(Assignment {
            task,
            load: load.acquire(&agent.id),
            agent,
            permit,
        });
        handle
    }

    #[tokio::test]
    async fn test_runs_assignment() {
        let pool = WorkerPool::new(&config(2, 2), ProcessManager::default(), None);
        let load = LoadTracker::new();

        let handle = submit(&pool, &load, "t-1", TaskSpec::new("echo").arg("pooled")).await;
        let result = handle.wait().await.unwrap();

        assert_eq!(result.stdout_lossy(), "pooled\n");
        assert_eq!(result.agent_id, "agent-1");
        assert_eq!(result.task_id, "t-1");
    }

    #[tokio::test]
    async fn test_reuses_parked_worker() {
        let pool = WorkerPool::new(&config(2, 2), ProcessManager::default(), None);
        let load = LoadTracker::new();

        for i in 0..5 {
            let handle = submit(&pool, &load, &format!("t-{}", i), TaskSpec::new("true")).await;
            handle.wait().await.unwrap();
        }

        let stats = pool.stats();
        assert!(stats.workers_spawned <= 2, "spawned {}", stats.workers_spawned);
        assert!(stats.live_workers <= 2);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_workers() {
        let pool = WorkerPool::new(&config(2, 2), ProcessManager::default(), None);
        let load = LoadTracker::new();

        let mut handles = Vec::new();
        for i in 0..6 {
            let spec = TaskSpec::new("sleep").arg("0.1");
            handles.push(submit(&pool, &load, &format!("t-{}", i), spec).await);
            assert!(pool.stats().busy_workers <= 2);
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert!(pool.stats().workers_spawned <= 2);
        assert!(load.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_idle_ceiling() {
        let pool = WorkerPool::new(&config(3, 1), ProcessManager::default(), None);
        let load = LoadTracker::new();

        let mut handles = Vec::new();
        for i in 0..3 {
            let spec = TaskSpec::new("sleep").arg("0.2");
            handles.push(submit(&pool, &load, &format!("t-{}", i), spec).await);
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        // workers beyond the ceiling exit once their job is done
        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            while pool.stats().live_workers > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
        assert_eq!(pool.stats().idle_workers, 1);
    }

    #[tokio::test]
    async fn test_close_releases_workers() {
        let pool = WorkerPool::new(&config(2, 2), ProcessManager::default(), None);
        let load = LoadTracker::new();

        submit(&pool, &load, "t-1", TaskSpec::new("true"))
            .await
            .wait()
            .await
            .unwrap();

        pool.close();
        tokio::time::timeout(Duration::from_secs(2), pool.wait())
            .await
            .unwrap();
        assert_eq!(pool.stats().live_workers, 0);
        assert!(pool.reserve().await.is_err());
    }

    #[tokio::test]
    async fn test_caches_task_output() {
        let cache = Arc::new(ContextCache::new(&Default::default()));
        let pool = WorkerPool::new(
            &config(1, 1),
            ProcessManager::default(),
            Some(Arc::clone(&cache)),
        );
        let load = LoadTracker::new();

        submit(&pool, &load, "t-cached", TaskSpec::new("echo").arg("kept"))
            .await
            .wait()
            .await
            .unwrap();

        let cached = cache.get(&task_key("t-cached")).unwrap().unwrap();
        assert_eq!(&cached[..], b"kept\n");
    }
}
