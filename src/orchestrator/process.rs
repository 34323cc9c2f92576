//! Spawning and supervising OS child processes.
//!
//! The `Child` is moved into a dedicated supervisor task that waits for it to
//! exit. Callers keep a [`ProcessHandle`] which can only ask for termination;
//! the supervisor owns the escalation: SIGTERM to the child's process group,
//! then SIGKILL once the grace period runs out. Output lines arrive on an
//! unbounded channel and the exit outcome on a oneshot, sent only after both
//! output readers have drained (or the drain deadline passed).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::LogStream;
use super::models::{CommandSpec, ProcessInfo, ProcessKind, ProjectId};

/// How long to wait for stdout/stderr readers after the child has exited.
/// Grandchildren that inherited the pipes could otherwise hold them open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub line: String,
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Termination was requested through the handle.
    pub terminated: bool,
    /// SIGKILL escalation was needed.
    pub killed: bool,
    /// Waiting on the child failed.
    pub error: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.code == Some(0)
    }

    /// A process we asked to stop counts as a clean exit whatever its code.
    pub fn clean(&self) -> bool {
        self.success() || (self.terminated && self.error.is_none())
    }
}

/// The orchestrator's record of a supervised OS child process.
pub struct ProcessHandle {
    info: ProcessInfo,
    term_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn pid(&self) -> Option<u32> {
        self.info.pid
    }

    /// Ask the supervisor to terminate the process. Fire-and-forget: returns
    /// whether the request was delivered (false once already requested or
    /// after the process has exited).
    pub fn terminate(&mut self) -> bool {
        match self.term_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Everything a caller gets back from [`spawn_supervised`].
pub struct Supervised {
    pub handle: ProcessHandle,
    pub output: mpsc::UnboundedReceiver<OutputLine>,
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Spawn `spec` in `cwd` and start supervising it.
///
/// Spawning itself is synchronous; only the supervision runs on the tokio
/// runtime, so this must be called from within one.
pub fn spawn_supervised(
    project_id: &ProjectId,
    kind: ProcessKind,
    spec: &CommandSpec,
    cwd: &Path,
    kill_grace: Duration,
) -> std::io::Result<Supervised> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    info!(project = %project_id, %kind, command = %spec.display(), "Spawning process");
    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!(project = %project_id, %kind, ?pid, "Process started");

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(stdout, LogStream::Stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(stderr, LogStream::Stderr, line_tx)));
    }

    let (term_tx, term_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(supervise(
        child,
        pid,
        term_rx,
        kill_grace,
        readers,
        exit_tx,
        format!("{}/{}", project_id, kind),
    ));

    Ok(Supervised {
        handle: ProcessHandle {
            info: ProcessInfo {
                project_id: project_id.clone(),
                kind,
                pid,
                started_at: Utc::now(),
            },
            term_tx: Some(term_tx),
        },
        output: line_rx,
        exit: exit_rx,
    })
}

async fn read_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(OutputLine { stream, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(?stream, "Output read failed: {}", e);
                break;
            }
        }
    }
}

/// Background task: owns `child`, waits for it to exit, reports the outcome.
///
/// Two ways the task can end:
/// 1. The process exits on its own and `child.wait()` resolves.
/// 2. `term_rx` fires: SIGTERM, then SIGKILL after `kill_grace`.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    term_rx: oneshot::Receiver<()>,
    kill_grace: Duration,
    readers: Vec<JoinHandle<()>>,
    exit_tx: oneshot::Sender<ProcessExit>,
    label: String,
) {
    let mut terminated = false;
    let mut killed = false;

    let result = tokio::select! {
        result = child.wait() => result,
        Ok(()) = term_rx => {
            terminated = true;
            signal_terminate(&mut child, pid);
            match tokio::time::timeout(kill_grace, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(process = %label, ?pid, "Process ignored SIGTERM for {:?}, killing", kill_grace);
                    killed = true;
                    signal_kill(&mut child, pid);
                    child.wait().await
                }
            }
        }
    };

    let exit = match result {
        Ok(status) => {
            debug!(process = %label, ?pid, ?status, "Process exited");
            ProcessExit {
                code: status.code(),
                terminated,
                killed,
                error: None,
            }
        }
        Err(e) => {
            warn!(process = %label, ?pid, "Failed to wait for process: {}", e);
            ProcessExit {
                code: None,
                terminated,
                killed,
                error: Some(e.to_string()),
            }
        }
    };

    for reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(process = %label, "Output reader still open after exit, detaching");
        }
    }

    let _ = exit_tx.send(exit);
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) -> bool {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    // The child leads its own process group, so -pid reaches its descendants too.
    unsafe { libc::kill(-pid, signal) == 0 }
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child, pid: Option<u32>) {
    if !signal_group(pid, libc::SIGTERM) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_kill(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, libc::SIGKILL);
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_kill(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}
