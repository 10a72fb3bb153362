// packages/engine/src/runtime/mod.rs
//! Task dispatch runtime
//!
//! - **Dispatcher**: the engine facade; admission, the dispatch loop, shutdown
//! - **Task Queue**: bounded lock-free FIFO between submitters and the loop
//! - **Selector**: capability matching and agent ranking
//! - **Worker Pool**: bounded, reusable workers that execute assignments
//! - **Process Manager**: child processes under a deadline
//! - **Task**: task specs, lifecycle states, results and handles
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     DispatchEngine                       │
//! │                                                          │
//! │  submit() ──► TaskQueue(Q) ──► dispatch loop             │
//! │                                   │ match agents         │
//! │                                   │ reserve slot (W)     │
//! │                                   │ select agent         │
//! │                                   ▼                      │
//! │                    ┌──────────────────────────┐          │
//! │                    │ WorkerPool (≤ W workers) │          │
//! │                    │  ┌────────┐ ┌────────┐   │          │
//! │                    │  │Worker 1│ │Worker 2│...│          │
//! │                    │  └───┬────┘ └───┬────┘   │          │
//! │                    └──────┼──────────┼────────┘          │
//! │                           ▼          ▼                   │
//! │                     ProcessManager (deadline, kill)      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod dispatcher;
pub mod process_manager;
pub mod selector;
pub mod task;
pub mod task_queue;
pub mod worker_pool;

pub use dispatcher::{DispatchEngine, DispatchStats, ShutdownReport};
pub use process_manager::{ExecRequest, ProcessManager, ProcessOutput};
pub use selector::{LoadGuard, LoadTracker};
pub use task::{ExitFailure, Rejection, TaskHandle, TaskResult, TaskSpec, TaskState};
pub use task_queue::{QueueStats, TaskQueue};
pub use worker_pool::{PoolStats, WorkerPool};
