//! Agent process runner.
//!
//! One OS process per story attempt. Output is streamed line by line to the
//! caller; exit status is reported by [`AgentRunner::wait`]; [`AgentRunner::kill`]
//! terminates the whole process group.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::model::LogChannel;

/// Grace period between terminate and force-kill.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Identifier of a spawned agent process.
pub type ProcessId = String;

/// Errors raised by the process runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn process '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("Process {0} not found")]
    UnknownProcess(ProcessId),

    #[error("Failed to wait for process: {0}")]
    Wait(#[from] io::Error),
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Human-readable label, usually the story id.
    pub label: String,
}

/// One line of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub channel: LogChannel,
    pub text: String,
}

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ExitStatus {
    /// Status reported for a process that was killed.
    pub fn killed() -> Self {
        Self {
            exit_code: None,
            success: false,
        }
    }
}

/// Agent process runner collaborator.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Starts a process, streaming its output lines into `output`.
    async fn spawn(
        &self,
        request: SpawnRequest,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ProcessId, RunnerError>;

    /// Waits for a process to exit. A killed process reports [`ExitStatus::killed`].
    async fn wait(&self, process_id: &str) -> Result<ExitStatus, RunnerError>;

    /// Terminates a process and everything it started.
    async fn kill(&self, process_id: &str) -> Result<(), RunnerError>;
}

struct TrackedProcess {
    pid: Option<u32>,
    exit_rx: Option<oneshot::Receiver<io::Result<std::process::ExitStatus>>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// [`AgentRunner`] backed by `tokio::process`.
pub struct ProcessRunner {
    next_id: AtomicU64,
    processes: Arc<Mutex<HashMap<ProcessId, TrackedProcess>>>,
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            processes: Arc::new(Mutex::new(HashMap::new())),
            grace_period: KILL_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Number of processes spawned and not yet waited on or killed.
    pub async fn active_count(&self) -> usize {
        self.processes.lock().await.len()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn forward_lines<R>(reader: R, channel: LogChannel, output: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if output.send(OutputLine { channel, text }).is_err() {
                break;
            }
        }
    });
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // Negative pid addresses the whole process group.
    let pgid = -(pid as i32);
    // SAFETY: kill(2) takes plain integers and touches no memory of ours; a
    // group that already exited only yields ESRCH, which is ignored.
    unsafe {
        libc::kill(pgid, signal);
    }
}

async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<io::Result<std::process::ExitStatus>>,
    grace_period: Duration,
) {
    let pid = child.id();
    let result = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    signal_group(pid, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    #[cfg(unix)]
                    {
                        if let Some(pid) = pid {
                            signal_group(pid, libc::SIGKILL);
                        }
                    }
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };
    let _ = exit_tx.send(result);
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn spawn(
        &self,
        request: SpawnRequest,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ProcessId, RunnerError> {
        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            executable: request.executable.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, LogChannel::Stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, LogChannel::Stderr, output);
        }

        let process_id = format!("proc-{}-{}", std::process::id(), self.next_id.fetch_add(1, Ordering::SeqCst));
        let pid = child.id();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, kill_rx, exit_tx, self.grace_period));

        debug!(process_id = %process_id, pid = ?pid, label = %request.label, "Spawned agent process");
        self.processes.lock().await.insert(
            process_id.clone(),
            TrackedProcess {
                pid,
                exit_rx: Some(exit_rx),
                kill_tx: Some(kill_tx),
            },
        );
        Ok(process_id)
    }

    async fn wait(&self, process_id: &str) -> Result<ExitStatus, RunnerError> {
        let exit_rx = {
            let mut processes = self.processes.lock().await;
            let tracked = processes
                .get_mut(process_id)
                .ok_or_else(|| RunnerError::UnknownProcess(process_id.to_string()))?;
            tracked.exit_rx.take()
        };
        let Some(exit_rx) = exit_rx else {
            return Err(RunnerError::UnknownProcess(process_id.to_string()));
        };

        let result = exit_rx.await;
        let killed = {
            let mut processes = self.processes.lock().await;
            match processes.remove(process_id) {
                Some(tracked) => tracked.kill_tx.is_none(),
                None => true,
            }
        };

        match result {
            Ok(Ok(_)) if killed => Ok(ExitStatus::killed()),
            Ok(Ok(status)) => Ok(ExitStatus {
                exit_code: status.code(),
                success: status.success(),
            }),
            Ok(Err(err)) => Err(RunnerError::Wait(err)),
            Err(_) => Ok(ExitStatus::killed()),
        }
    }

    async fn kill(&self, process_id: &str) -> Result<(), RunnerError> {
        let mut processes = self.processes.lock().await;
        let tracked = processes
            .get_mut(process_id)
            .ok_or_else(|| RunnerError::UnknownProcess(process_id.to_string()))?;
        match tracked.kill_tx.take() {
            Some(kill_tx) => {
                debug!(process_id = %process_id, pid = ?tracked.pid, "Killing agent process group");
                let _ = kill_tx.send(());
            }
            None => warn!(process_id = %process_id, "Kill already requested"),
        }
        Ok(())
    }
}
