//! Run handle and supervisor for a single command execution
//!
//! A run moves through: Running -> (Succeeded | Failed | Cancelled)

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::output::Utf8Chunker;
use super::process::{group_alive, signal_group, RunnerOptions};

/// Exit code the shell uses when the command cannot be found
pub const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;

const READ_BUFFER_SIZE: usize = 8192;

/// Status of a command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Nothing has been started
    Idle,
    /// Process is running
    Running,
    /// Process exited with code 0
    Succeeded,
    /// Process exited unsuccessfully
    Failed(RunFailure),
    /// Process was terminated on request
    Cancelled,
}

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// Exited with a non-zero code
    NonZeroExit(i32),
    /// The shell could not find the command
    CommandNotFound,
    /// Killed by a signal nobody here sent
    Signalled(i32),
    /// The shell could not be started at all
    Spawn(String),
    /// The process state could not be collected
    Wait(String),
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Idle | RunStatus::Running)
    }

    /// Exit code, present only for succeeded/failed runs that exited normally
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunStatus::Succeeded => Some(0),
            RunStatus::Failed(RunFailure::NonZeroExit(code)) => Some(*code),
            RunStatus::Failed(RunFailure::CommandNotFound) => Some(COMMAND_NOT_FOUND_EXIT_CODE),
            _ => None,
        }
    }

    /// Line appended to the logs when a run ends
    pub fn marker(&self) -> Option<String> {
        match self {
            RunStatus::Idle | RunStatus::Running => None,
            RunStatus::Succeeded => Some("Process exited with code 0".to_string()),
            RunStatus::Failed(RunFailure::NonZeroExit(code)) => {
                Some(format!("Process exited with code {}", code))
            }
            RunStatus::Failed(RunFailure::CommandNotFound) => Some(format!(
                "Command not found (exit code {})",
                COMMAND_NOT_FOUND_EXIT_CODE
            )),
            RunStatus::Failed(RunFailure::Signalled(signal)) => {
                Some(format!("Process terminated by signal {}", signal))
            }
            RunStatus::Failed(RunFailure::Spawn(e)) => Some(format!("Error running command: {}", e)),
            RunStatus::Failed(RunFailure::Wait(e)) => {
                Some(format!("Lost track of process: {}", e))
            }
            RunStatus::Cancelled => Some("Process cancelled".to_string()),
        }
    }

    fn from_exit(status: ExitStatus, cancelled: bool) -> Self {
        if cancelled {
            return RunStatus::Cancelled;
        }
        match status.code() {
            Some(0) => RunStatus::Succeeded,
            Some(COMMAND_NOT_FOUND_EXIT_CODE) => RunStatus::Failed(RunFailure::CommandNotFound),
            Some(code) => RunStatus::Failed(RunFailure::NonZeroExit(code)),
            None => RunStatus::Failed(RunFailure::Signalled(status.signal().unwrap_or(0))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed(_) => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Event produced by a running command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Next chunk of merged stdout/stderr
    Output(String),
    /// Terminal status; always the last event
    Finished(RunStatus),
}

/// Result of a non-blocking poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPoll {
    /// Output received since the previous poll, in order
    pub chunks: Vec<String>,
    /// Current status
    pub status: RunStatus,
}

/// Handle to one running (or finished) command
pub struct RunHandle {
    pgid: Option<i32>,
    status: RunStatus,
    output: Vec<String>,
    events: mpsc::UnboundedReceiver<RunEvent>,
    cancel_tx: watch::Sender<bool>,
}

impl RunHandle {
    pub(crate) fn new(
        pgid: Option<i32>,
        events: mpsc::UnboundedReceiver<RunEvent>,
        cancel_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            pgid,
            status: RunStatus::Running,
            output: Vec::new(),
            events,
            cancel_tx,
        }
    }

    /// Process id of the shell, which is also its process group id
    pub fn pid(&self) -> Option<u32> {
        self.pgid.map(|pgid| pgid as u32)
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Every chunk received so far
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Accumulated output as one string
    pub fn output_text(&self) -> String {
        self.output.concat()
    }

    /// Collect output that arrived since the last call without blocking
    pub fn poll(&mut self) -> RunPoll {
        let mut chunks = Vec::new();
        while !self.status.is_terminal() {
            match self.events.try_recv() {
                Ok(event) => {
                    if let RunEvent::Output(chunk) = self.apply(event) {
                        chunks.push(chunk);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.lost_supervisor();
                    break;
                }
            }
        }
        RunPoll {
            chunks,
            status: self.status.clone(),
        }
    }

    /// Wait for the next event; `None` once the terminal status was delivered
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        if self.status.is_terminal() {
            return None;
        }
        match self.events.recv().await {
            Some(event) => Some(self.apply(event)),
            None => {
                self.lost_supervisor();
                Some(RunEvent::Finished(self.status.clone()))
            }
        }
    }

    /// Ask the supervisor to terminate the process group without waiting
    pub fn request_cancel(&self) {
        if !self.status.is_terminal() {
            let _ = self.cancel_tx.send(true);
        }
    }

    /// Terminate the process group and wait until it has exited
    ///
    /// SIGTERM first, SIGKILL once the grace period elapses. Output produced
    /// meanwhile is still collected. Calling this after the process exited
    /// returns the existing terminal status.
    pub async fn cancel(&mut self) -> RunStatus {
        self.request_cancel();
        self.wait().await
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> RunStatus {
        while self.next_event().await.is_some() {}
        self.status.clone()
    }

    fn apply(&mut self, event: RunEvent) -> RunEvent {
        match &event {
            RunEvent::Output(chunk) => self.output.push(chunk.clone()),
            RunEvent::Finished(status) => self.status = status.clone(),
        }
        event
    }

    fn lost_supervisor(&mut self) {
        warn!(pgid = ?self.pgid, "Supervisor ended without reporting a status");
        self.status = RunStatus::Failed(RunFailure::Wait("supervisor ended".to_string()));
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        // Abandoned mid-run: nothing will collect the output, kill immediately
        if let Some(pgid) = self.pgid {
            warn!(pgid, "Run handle dropped while running, killing process group");
            signal_group(pgid, Signal::SIGKILL);
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("pgid", &self.pgid)
            .field("status", &self.status)
            .field("chunks", &self.output.len())
            .finish()
    }
}

/// Own the child until it exits, forwarding output and the final status
pub(crate) async fn supervise(
    mut child: Child,
    mut reader: pipe::Receiver,
    pgid: Option<i32>,
    mut cancel_rx: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<RunEvent>,
    options: RunnerOptions,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Chunker::default();
    let mut eof = false;
    let mut exit: Option<std::io::Result<ExitStatus>> = None;
    let mut cancelled = false;
    let mut stop_requested = false;
    let mut kill_at: Option<Instant> = None;
    let mut drain_until: Option<Instant> = None;

    while exit.is_none() || !eof {
        tokio::select! {
            read = reader.read(&mut buf), if !eof => match read {
                Ok(0) => eof = true,
                Ok(n) => {
                    if let Some(text) = decoder.push(&buf[..n]) {
                        let _ = events.send(RunEvent::Output(text));
                    }
                }
                Err(e) => {
                    warn!(pgid = ?pgid, error = %e, "Reading command output failed");
                    eof = true;
                }
            },
            status = child.wait(), if exit.is_none() => {
                if cancelled {
                    sweep_group(pgid);
                }
                exit = Some(status);
                drain_until = Some(Instant::now() + options.drain_timeout);
            },
            changed = cancel_rx.changed(), if !stop_requested => {
                // An error means the handle is gone, which counts as a cancel
                if changed.is_err() || *cancel_rx.borrow() {
                    stop_requested = true;
                    if exit.is_some() {
                        // The shell exited on its own and keeps its status
                        debug!(pgid = ?pgid, "Cancel during drain, stopping leftovers");
                        sweep_group(pgid);
                        eof = true;
                    } else {
                        info!(pgid = ?pgid, "Cancelling command");
                        cancelled = true;
                        match pgid {
                            Some(pgid) => {
                                signal_group(pgid, Signal::SIGTERM);
                            }
                            None => {
                                let _ = child.start_kill();
                            }
                        }
                        kill_at = Some(Instant::now() + options.grace_period);
                    }
                }
            },
            _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() && exit.is_none() => {
                warn!(pgid = ?pgid, grace = ?options.grace_period, "Command ignored SIGTERM, sending SIGKILL");
                match pgid {
                    Some(pgid) => {
                        signal_group(pgid, Signal::SIGKILL);
                    }
                    None => {
                        let _ = child.start_kill();
                    }
                }
                kill_at = None;
            },
            _ = sleep_until(drain_until.unwrap_or_else(Instant::now)), if drain_until.is_some() && !eof => {
                debug!(pgid = ?pgid, "Output still open after exit, stopping drain");
                eof = true;
            },
        }
    }

    if let Some(text) = decoder.finish() {
        let _ = events.send(RunEvent::Output(text));
    }

    // Background jobs of the shell must not outlive the run
    sweep_group(pgid);

    let status = match exit {
        Some(Ok(exit_status)) => RunStatus::from_exit(exit_status, cancelled),
        Some(Err(e)) => RunStatus::Failed(RunFailure::Wait(e.to_string())),
        None => RunStatus::Failed(RunFailure::Wait("no exit status".to_string())),
    };

    info!(pgid = ?pgid, status = %status, exit_code = ?status.exit_code(), "Command finished");
    let _ = events.send(RunEvent::Finished(status));
}

/// SIGKILL whatever is still in the group once the leader is gone
fn sweep_group(pgid: Option<i32>) {
    if let Some(pgid) = pgid {
        if group_alive(pgid) {
            debug!(pgid, "Killing processes left in the group");
            signal_group(pgid, Signal::SIGKILL);
        }
    }
}
