// packages/engine/src/runtime/task.rs
//! Task model
//!
//! A submitted [`TaskSpec`] becomes an internal [`Task`] that moves through
//! the dispatch states:
//!
//! ```text
//! Submitted -> Queued -> Selecting -> Dispatched -> Executing -> Completed
//!     |                       |                          |-> Failed
//!     |                       |                          |-> TimedOut
//!     |                       `-> Rejected(NoAgentAvailable)
//!     |-> Rejected(QueueFull)
//!     `-> Rejected(NoAgentAvailable)
//! ```
//!
//! Every task owns exactly one result channel. [`Task::finish`] consumes the
//! task, so the outcome is delivered at most once; a task dropped without
//! finishing delivers [`EngineError::ShuttingDown`] from its drop, so the
//! caller is never left without an answer.

use super::process_manager::ProcessOutput;
use crate::observability::{TASKS_FINISHED, TASK_DURATION};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn, Span};

/// Slack on top of deadline + kill grace before a waiting caller gives up
const RESULT_SETTLE: Duration = Duration::from_millis(500);

/// Stand-in for "never" when a deadline does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `base + by`, saturating at [`FAR_FUTURE`] from `base`
pub(crate) fn saturating_after(base: Instant, by: Duration) -> Instant {
    base.checked_add(by.min(FAR_FUTURE)).unwrap_or(base)
}

/// What a caller submits
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// Caller-chosen id; a ULID is generated when absent
    pub id: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    /// Capabilities the executing agent must declare
    pub capabilities: BTreeSet<String>,
    /// Written to the process's stdin
    pub payload: Bytes,
    /// Relative to submission; the engine default applies when absent
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn requires<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a task never reached execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    QueueFull,
    NoAgentAvailable,
}

/// Dispatch lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Queued,
    Selecting,
    Dispatched,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Rejected(Rejection),
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled | Self::Rejected(_)
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Queued) | (Submitted, Rejected(_)) => true,
            (Queued, Selecting) => true,
            (Selecting, Dispatched) | (Selecting, Rejected(Rejection::NoAgentAvailable)) => true,
            (Dispatched, Executing) => true,
            (Executing, Completed) => true,
            // cancellation, deadline and shutdown can end a task at any live stage
            (from, Failed | TimedOut | Cancelled) => !from.is_terminal() && from != Submitted,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Selecting => "selecting",
            Self::Dispatched => "dispatched",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Rejected(Rejection::QueueFull) => "rejected_queue_full",
            Self::Rejected(Rejection::NoAgentAvailable) => "rejected_no_agent",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process that ran to exit failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExitFailure {
    #[error("process exited with status {0}")]
    NonZeroExit(i32),

    #[error("process terminated by signal {0}")]
    Signaled(i32),
}

impl ExitFailure {
    pub fn from_status(status: ExitStatus) -> Option<Self> {
        use std::os::unix::process::ExitStatusExt;

        if status.success() {
            return None;
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => Some(Self::NonZeroExit(code)),
            (None, Some(signal)) => Some(Self::Signaled(signal)),
            (None, None) => Some(Self::NonZeroExit(-1)),
        }
    }
}

/// Outcome of a task whose process ran to exit
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: Option<i32>,
    /// `None` on a zero exit
    pub error: Option<ExitFailure>,
    pub duration: Duration,
}

impl TaskResult {
    pub(crate) fn from_output(task_id: &str, agent_id: &str, output: ProcessOutput) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            exit_code: output.status.code(),
            error: ExitFailure::from_status(output.status),
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            duration: output.duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Single-use sender for a task's outcome
pub(crate) struct ResultSender {
    task_id: String,
    tx: Option<oneshot::Sender<Result<TaskResult>>>,
}

impl ResultSender {
    fn new(task_id: String, tx: oneshot::Sender<Result<TaskResult>>) -> Self {
        Self { task_id, tx: Some(tx) }
    }

    /// Deliver the outcome; false if it was already delivered
    fn fulfill(&mut self, outcome: Result<TaskResult>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(task_id = %self.task_id, "Caller stopped waiting for result");
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!(task_id = %self.task_id, "Task dropped without an outcome");
            let _ = tx.send(Err(EngineError::ShuttingDown));
        }
    }
}

/// A task inside the engine
pub(crate) struct Task {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub capabilities: BTreeSet<String>,
    pub payload: Bytes,
    pub timeout: Duration,
    pub deadline: Instant,
    pub submitted_at: Instant,
    pub cancel: CancellationToken,
    pub span: Span,
    state: TaskState,
    result: ResultSender,
}

impl Task {
    /// Build the task and the caller's handle for it
    pub fn new(
        id: String,
        spec: TaskSpec,
        timeout: Duration,
        kill_grace: Duration,
        cancel: CancellationToken,
    ) -> (Self, TaskHandle) {
        let submitted_at = Instant::now();
        let deadline = saturating_after(submitted_at, timeout);
        let (tx, rx) = oneshot::channel();
        let span = tracing::info_span!(
            "task",
            task_id = %id,
            agent_id = tracing::field::Empty
        );

        let handle = TaskHandle {
            id: id.clone(),
            timeout,
            wait_until: saturating_after(deadline, kill_grace.saturating_add(RESULT_SETTLE)),
            cancel: cancel.clone(),
            rx,
            _guard: cancel.clone().drop_guard(),
        };

        let task = Self {
            result: ResultSender::new(id.clone(), tx),
            id,
            command: spec.command,
            args: spec.args,
            capabilities: spec.capabilities,
            payload: spec.payload,
            timeout,
            deadline,
            submitted_at,
            cancel,
            span,
            state: TaskState::Submitted,
        };
        (task, handle)
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn advance(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal task transition {} -> {}",
            self.state,
            next
        );
        debug!(parent: &self.span, from = %self.state, to = %next, "Task state changed");
        self.state = next;
    }

    /// Deliver an admission-time rejection
    ///
    /// A task handed back by a failed queue push was never queued, so it is
    /// rejected from `Submitted`.
    pub fn reject(mut self, error: EngineError) {
        self.state = TaskState::Submitted;
        self.finish(Err(error));
    }

    /// Move to the terminal state matching `outcome` and deliver it
    pub fn finish(mut self, outcome: Result<TaskResult>) {
        let terminal = match &outcome {
            Ok(_) => TaskState::Completed,
            Err(EngineError::Timeout { .. }) => TaskState::TimedOut,
            Err(EngineError::Cancelled) => TaskState::Cancelled,
            Err(EngineError::QueueFull { .. }) => TaskState::Rejected(Rejection::QueueFull),
            Err(EngineError::NoAgentAvailable { .. }) => {
                TaskState::Rejected(Rejection::NoAgentAvailable)
            }
            Err(_) => TaskState::Failed,
        };
        self.advance(terminal);

        metrics::counter!(TASKS_FINISHED, "outcome" => terminal.as_str()).increment(1);
        metrics::histogram!(TASK_DURATION).record(self.submitted_at.elapsed().as_secs_f64());

        self.result.fulfill(outcome);
    }
}

/// Caller's side of a submitted task
///
/// Dropping the handle cancels the task.
pub struct TaskHandle {
    id: String,
    timeout: Duration,
    wait_until: Instant,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Result<TaskResult>>,
    _guard: DropGuard,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation; the outcome still arrives through [`wait`](Self::wait)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the outcome
    ///
    /// Bounded by the task deadline plus the kill grace period, after which
    /// the task is cancelled and `Timeout` is returned.
    pub async fn wait(self) -> Result<TaskResult> {
        let Self {
            timeout,
            wait_until,
            cancel,
            rx,
            _guard,
            ..
        } = self;

        match tokio::time::timeout_at(wait_until, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(EngineError::ShuttingDown),
            Err(_) => {
                cancel.cancel();
                Err(EngineError::Timeout { after: timeout })
            }
        }
    }

    /// Wait for the outcome, cancelling the task if `caller` fires first
    pub async fn wait_with_cancel(self, caller: &CancellationToken) -> Result<TaskResult> {
        tokio::select! {
            outcome = self.wait() => outcome,
            // dropping the wait future drops the guard, which cancels the task
            _ = caller.cancelled() => Err(EngineError::Cancelled),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(timeout: Duration) -> (Task, TaskHandle) {
        Task::new(
            "t-1".to_string(),
            TaskSpec::new("echo").arg("hi").require("echo"),
            timeout,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
    }

    fn result() -> TaskResult {
        TaskResult {
            task_id: "t-1".into(),
            agent_id: "a-1".into(),
            stdout: Bytes::from_static(b"hi\n"),
            stderr: Bytes::new(),
            exit_code: Some(0),
            error: None,
            duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::new("python3")
            .args(["-m", "agent"])
            .requires(["nlp", "search"])
            .payload(&b"{}"[..])
            .timeout(Duration::from_secs(3));

        assert_eq!(spec.args, vec!["-m", "agent"]);
        assert_eq!(spec.capabilities.len(), 2);
        assert_eq!(spec.payload, Bytes::from_static(b"{}"));
        assert_eq!(spec.timeout, Some(Duration::from_secs(3)));
        assert!(spec.id.is_none());
    }

    #[test]
    fn test_lifecycle_edges() {
        use TaskState::*;
        assert!(Submitted.can_transition_to(Queued));
        assert!(Submitted.can_transition_to(Rejected(Rejection::QueueFull)));
        assert!(Submitted.can_transition_to(Rejected(Rejection::NoAgentAvailable)));
        assert!(Selecting.can_transition_to(Rejected(Rejection::NoAgentAvailable)));
        assert!(Executing.can_transition_to(TimedOut));
        assert!(Queued.can_transition_to(Failed));

        assert!(!Submitted.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Rejected(Rejection::QueueFull)));
        assert!(!Executing.can_transition_to(Rejected(Rejection::QueueFull)));
    }

    #[test]
    fn test_exit_failure_classification() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(ExitFailure::from_status(ExitStatus::from_raw(0)), None);
        assert_eq!(
            ExitFailure::from_status(ExitStatus::from_raw(2 << 8)),
            Some(ExitFailure::NonZeroExit(2))
        );
        assert_eq!(
            ExitFailure::from_status(ExitStatus::from_raw(9)),
            Some(ExitFailure::Signaled(9))
        );
    }

    #[tokio::test]
    async fn test_finish_delivers_once() {
        let (mut task, handle) = task(Duration::from_secs(5));
        task.advance(TaskState::Queued);
        task.advance(TaskState::Selecting);
        task.advance(TaskState::Dispatched);
        task.advance(TaskState::Executing);
        task.finish(Ok(result()));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.stdout_lossy(), "hi\n");
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_rejected_at_admission() {
        let (mut task, handle) = task(Duration::from_secs(5));
        task.advance(TaskState::Queued);
        task.reject(EngineError::QueueFull { capacity: 1 });
        assert!(matches!(
            handle.wait().await,
            Err(EngineError::QueueFull { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let (mut task, handle) = task(Duration::MAX);
        assert!(task.deadline > Instant::now() + Duration::from_secs(86_400));
        assert!(handle.wait_until >= task.deadline);

        task.advance(TaskState::Queued);
        task.finish(Err(EngineError::Cancelled));
        assert!(matches!(handle.wait().await, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_task_still_answers() {
        let (task, handle) = task(Duration::from_secs(5));
        drop(task);
        assert!(matches!(handle.wait().await, Err(EngineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_task() {
        let (task, handle) = task(Duration::from_secs(5));
        assert!(!task.cancel.is_cancelled());
        drop(handle);
        assert!(task.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_is_bounded_by_deadline() {
        let (task, handle) = task(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let outcome = handle.wait().await;

        assert!(matches!(outcome, Err(EngineError::Timeout { .. })));
        assert!(task.cancel.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_wait_with_cancel() {
        let (task, handle) = task(Duration::from_secs(5));
        let caller = CancellationToken::new();
        caller.cancel();

        let outcome = handle.wait_with_cancel(&caller).await;
        assert!(matches!(outcome, Err(EngineError::Cancelled)));
        assert!(task.cancel.is_cancelled());
    }
}
