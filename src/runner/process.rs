//! Child process plumbing: shell spawning, merged output pipe, group signals

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use super::handle::{supervise, RunHandle};

/// Configuration for the command runner
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Shell used to interpret the command line (`<shell> -c <command>`)
    pub shell: PathBuf,
    /// Time between SIGTERM and SIGKILL when cancelling
    pub grace_period: Duration,
    /// How long to keep reading output after the shell itself has exited
    pub drain_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            grace_period: Duration::from_secs(1),
            drain_timeout: Duration::from_millis(200),
        }
    }
}

/// Error type for starting a command
#[derive(Debug)]
pub enum RunnerError {
    /// Command line is empty or cannot form an executable invocation
    InvalidCommand(String),
    /// The output pipe could not be created
    Pipe(std::io::Error),
    /// The shell process could not be spawned
    Spawn(std::io::Error),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::InvalidCommand(reason) => write!(f, "Invalid command: {}", reason),
            RunnerError::Pipe(e) => write!(f, "Failed to create output pipe: {}", e),
            RunnerError::Spawn(e) => write!(f, "Failed to spawn command: {}", e),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::InvalidCommand(_) => None,
            RunnerError::Pipe(e) | RunnerError::Spawn(e) => Some(e),
        }
    }
}

/// Starts commands with a fixed set of options
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    options: RunnerOptions,
}

impl CommandRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Check that a command line can be handed to the shell
    pub fn validate(command_line: &str) -> Result<(), RunnerError> {
        if command_line.trim().is_empty() {
            return Err(RunnerError::InvalidCommand("command is empty".to_string()));
        }
        if command_line.contains('\0') {
            return Err(RunnerError::InvalidCommand(
                "command contains a NUL byte".to_string(),
            ));
        }
        Ok(())
    }

    /// Start a command in `working_directory`
    ///
    /// Must be called from within a tokio runtime; the supervisor runs as a
    /// spawned task.
    pub fn start(
        &self,
        command_line: &str,
        working_directory: &Path,
    ) -> Result<RunHandle, RunnerError> {
        Self::validate(command_line)?;

        let (read_end, write_end) = output_pipe().map_err(RunnerError::Pipe)?;
        let child = spawn_shell(&self.options.shell, command_line, working_directory, write_end)?;

        // The child leads its own group, so pgid == pid
        let pgid = child.id().map(|pid| pid as i32);
        info!(
            pid = ?pgid,
            cwd = %working_directory.display(),
            command = %command_line,
            "Command started"
        );

        let reader = pipe::Receiver::from_owned_fd(read_end).map_err(RunnerError::Pipe)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Supervisor logs stay inside the caller's span (session id)
        tokio::spawn(
            supervise(child, reader, pgid, cancel_rx, events_tx, self.options.clone())
                .in_current_span(),
        );

        Ok(RunHandle::new(pgid, events_rx, cancel_tx))
    }
}

/// Spawn `<shell> -c <command_line>` writing both streams into `output`
///
/// The command (and with it the parent's copies of the write end) is dropped
/// before returning, so the read end sees EOF once every child closes it.
fn spawn_shell(
    shell: &Path,
    command_line: &str,
    working_directory: &Path,
    output: OwnedFd,
) -> Result<Child, RunnerError> {
    let stderr = output.try_clone().map_err(RunnerError::Pipe)?;

    let mut std_cmd = std::process::Command::new(shell);
    std_cmd
        .arg("-c")
        .arg(command_line)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output))
        .stderr(Stdio::from(stderr))
        .process_group(0);

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    cmd.spawn().map_err(RunnerError::Spawn)
}

/// Create a close-on-exec pipe, returning `(read_end, write_end)`
fn output_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid buffer of two descriptors for pipe(2)
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: both descriptors were just returned by pipe(2) and have no other owner
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    set_cloexec(&read_end)?;
    set_cloexec(&write_end)?;
    Ok((read_end, write_end))
}

fn set_cloexec(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: raw is an open descriptor owned by `fd` for the duration of these calls
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Send a signal to every process in a group
///
/// Returns false if the group no longer exists.
pub(crate) fn signal_group(pgid: i32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => {
            debug!(pgid, signal = ?signal, "Signalled process group");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, signal = ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// True while any process in the group is still alive (zombies included)
pub fn group_alive(pgid: i32) -> bool {
    match killpg(Pid::from_raw(pgid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
