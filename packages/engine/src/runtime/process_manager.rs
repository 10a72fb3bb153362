// packages/engine/src/runtime/process_manager.rs
//! Process manager: runs a task's command under a hard deadline
//!
//! stdout and stderr are drained concurrently with the wait (and with the
//! stdin payload write), so a child that fills one pipe while we read the
//! other cannot stall. Each child leads its own process group; on timeout
//! or cancellation the whole group gets SIGTERM, then SIGKILL once the
//! grace period lapses, and the child is reaped before we return.
//!
//! The call returns when the child exits. Anything it left running in its
//! group that still holds the output pipes gets [`OUTPUT_SETTLE`] to finish,
//! then SIGKILL; output read up to that point is kept.
//!
//! Output captured before a timeout is discarded: the call fails with
//! [`EngineError::Timeout`] and carries no partial stdout/stderr.

use super::task::saturating_after;
use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One execution: command line, optional stdin payload, deadline, cancellation
pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub stdin: &'a [u8],
    pub deadline: Instant,
    pub cancel: &'a CancellationToken,
}

/// Output of a process that ran to exit (successfully or not)
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// How long the output pipes may stay open once the child has exited
pub const OUTPUT_SETTLE: Duration = Duration::from_millis(500);

/// stdout drain, stderr drain, stdin feed
type Streams = (io::Result<()>, io::Result<()>, io::Result<()>);

enum Waited {
    Exited {
        status: io::Result<ExitStatus>,
        /// `None` when the pipes were still open after the settle window
        streams: Option<Streams>,
    },
    TimedOut,
    Cancelled,
}

/// Spawns and supervises task processes
#[derive(Debug, Clone)]
pub struct ProcessManager {
    /// Time between SIGTERM and SIGKILL
    kill_grace: Duration,
}

impl ProcessManager {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run `command args` with a relative deadline and no stdin
    pub async fn execute(&self, command: &str, args: &[String], timeout: Duration) -> Result<ProcessOutput> {
        let cancel = CancellationToken::new();
        self.run(ExecRequest {
            command,
            args,
            stdin: &[],
            deadline: saturating_after(Instant::now(), timeout),
            cancel: &cancel,
        })
        .await
    }

    /// Run a process to exit, deadline or cancellation, whichever comes first
    ///
    /// A non-zero exit is a normal outcome and returns `Ok`; `Err` means the
    /// process could not be started or observed, timed out, or was cancelled.
    pub async fn run(&self, request: ExecRequest<'_>) -> Result<ProcessOutput> {
        let failed = |reason: String| EngineError::ExecutionFailed {
            command: request.command.to_string(),
            reason,
        };

        let started = Instant::now();
        if started >= request.deadline {
            return Err(EngineError::Timeout { after: Duration::ZERO });
        }

        let mut std_command = std::process::Command::new(request.command);
        std_command
            .args(request.args)
            .stdin(if request.stdin.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| failed(format!("failed to spawn process: {}", e)))?;
        let group = child.id().map(|pid| Pid::from_raw(pid as i32));
        debug!(pid = ?child.id(), command = request.command, "Spawned process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failed("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| failed("stderr was not captured".into()))?;
        let stdin = child.stdin.take();

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let waited = {
            let streams = async {
                tokio::join!(
                    drain(stdout, &mut stdout_buf),
                    drain(stderr, &mut stderr_buf),
                    feed(stdin, request.stdin)
                )
            };
            let exit = child.wait();
            tokio::pin!(streams, exit);

            let mut drained: Option<Streams> = None;
            let waited = loop {
                tokio::select! {
                    status = &mut exit => break Waited::Exited {
                        status,
                        streams: drained.take(),
                    },
                    done = &mut streams, if drained.is_none() => drained = Some(done),
                    _ = tokio::time::sleep_until(request.deadline) => break Waited::TimedOut,
                    _ = request.cancel.cancelled() => break Waited::Cancelled,
                }
            };

            match waited {
                Waited::Exited {
                    status,
                    streams: None,
                } => Waited::Exited {
                    status,
                    streams: settle(&mut streams, group, request.command).await,
                },
                other => other,
            }
        };

        match waited {
            Waited::Exited { status, streams } => {
                let status = status.map_err(|e| failed(format!("failed to wait for process: {}", e)))?;
                if let Some((stdout, stderr, stdin)) = streams {
                    stdout.map_err(|e| failed(format!("failed to read stdout: {}", e)))?;
                    stderr.map_err(|e| failed(format!("failed to read stderr: {}", e)))?;
                    if let Err(e) = stdin {
                        warn!(command = request.command, "Failed to write stdin payload: {}", e);
                    }
                }

                let duration = started.elapsed();
                debug!(command = request.command, %status, ?duration, "Process exited");
                Ok(ProcessOutput {
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                    status,
                    duration,
                })
            }
            Waited::TimedOut => {
                self.terminate(&mut child).await;
                let after = started.elapsed();
                debug!(command = request.command, ?after, "Process timed out");
                Err(EngineError::Timeout { after })
            }
            Waited::Cancelled => {
                self.terminate(&mut child).await;
                debug!(command = request.command, "Process cancelled");
                Err(EngineError::Cancelled)
            }
        }
    }

    /// SIGTERM the process group, SIGKILL after the grace period, then reap
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        let group = Pid::from_raw(pid as i32);

        debug!("Sending SIGTERM to process group {}", group);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("SIGTERM to group {} failed: {}", group, e);
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Process {} exited after SIGTERM: {}", pid, status),
            Ok(Err(e)) => warn!("Error waiting for process {}: {}", pid, e),
            Err(_) => warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, self.kill_grace),
        }

        // also catches anything the child left behind in its group
        let _ = killpg(group, Signal::SIGKILL);
        if let Err(e) = child.kill().await {
            debug!("Final kill of process {}: {}", pid, e);
        }
    }

    /// Check if a process is running
    pub fn is_running(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Read `reader` to EOF into `buf`; bytes read stay in `buf` if the future is dropped
async fn drain<R: AsyncRead + Unpin>(mut reader: R, buf: &mut Vec<u8>) -> io::Result<()> {
    reader.read_to_end(buf).await.map(|_| ())
}

/// Wait for the output pipes of a child that has already exited
///
/// Whatever still holds them open after [`OUTPUT_SETTLE`] is killed with
/// the rest of the child's process group, which closes the pipes.
async fn settle<F>(streams: &mut F, group: Option<Pid>, command: &str) -> Option<Streams>
where
    F: Future<Output = Streams> + Unpin,
{
    if let Ok(done) = tokio::time::timeout(OUTPUT_SETTLE, &mut *streams).await {
        return Some(done);
    }

    debug!(command, "Process exited but its output is still open, killing its group");
    if let Some(group) = group {
        let _ = killpg(group, Signal::SIGKILL);
    }
    match tokio::time::timeout(OUTPUT_SETTLE, &mut *streams).await {
        Ok(done) => Some(done),
        Err(_) => {
            warn!(command, "Output pipes still open after killing the process group");
            None
        }
    }
}

async fn feed(stdin: Option<ChildStdin>, payload: &[u8]) -> io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match stdin.write_all(payload).await {
        // the child is free to exit without reading its input
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
    // dropping stdin closes the pipe
}
