//! Console feedback surface
//!
//! Line-oriented rendering of a feedback session for terminals:
//! - Summary, command and auto-run flag when the session opens
//! - Command output streamed as it arrives
//! - Slash commands to run, stop, edit and submit
//!
//! Rendering and input each run on their own thread so a blocked read never
//! delays output. Input waits until the session has opened, so every edit
//! starts from the config the session loaded.
//!
//! A launcher reads its terminal through one shared line reader. The input
//! thread of a finished session stops taking lines, leaving them for the
//! next session.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::ProjectConfig;
use crate::session::{
    surface_pair, HumanAction, SessionRequest, SessionState, SessionSurface, SurfaceHandle,
    UiEvent,
};
use crate::tool::SurfaceLauncher;

const HELP: &str = "\
Commands:
  /run            run the command
  /stop           stop the running command
  /skip           skip running, go to feedback
  /cmd <command>  change the command
  /auto on|off    run automatically next time
  /save           save the configuration
  /send           submit the feedback typed so far
  /help           show this help
Any other line is added to your feedback. End of input also submits.";

/// How often an idle input thread checks whether its session is over
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Run,
    Stop,
    Skip,
    SetCommand(String),
    SetAuto(bool),
    Save,
    Send,
    Help,
    /// Unrecognized slash command
    Unknown(String),
    /// Feedback text
    Text(String),
}

/// Parse a line typed by the human
pub fn parse_line(line: &str) -> ConsoleCommand {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return ConsoleCommand::Text(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match name {
        "run" => ConsoleCommand::Run,
        "stop" | "cancel" => ConsoleCommand::Stop,
        "skip" => ConsoleCommand::Skip,
        "cmd" | "command" => ConsoleCommand::SetCommand(arg.to_string()),
        "auto" => match arg {
            "on" | "true" | "yes" => ConsoleCommand::SetAuto(true),
            "off" | "false" | "no" => ConsoleCommand::SetAuto(false),
            _ => ConsoleCommand::Unknown(trimmed.to_string()),
        },
        "save" => ConsoleCommand::Save,
        "send" | "submit" => ConsoleCommand::Send,
        "help" | "?" => ConsoleCommand::Help,
        _ => ConsoleCommand::Unknown(trimmed.to_string()),
    }
}

/// Where the console reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleTarget {
    /// stdin / stderr (stdout is left for the final result)
    Stdio,
    /// The controlling terminal, for when stdio carries a protocol
    Tty,
}

/// Opens a console surface per session
#[derive(Debug)]
pub struct ConsoleLauncher {
    target: ConsoleTarget,
    reader: Mutex<Option<LineReader>>,
}

impl ConsoleLauncher {
    pub fn new(target: ConsoleTarget) -> Self {
        Self {
            target,
            reader: Mutex::new(None),
        }
    }

    /// Lines from the target, started on first use and after end of input
    fn lines(&self) -> std::io::Result<SharedLines> {
        let mut reader = self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = reader.as_ref().filter(|r| !r.thread.is_finished()) {
            return Ok(Arc::clone(&existing.lines));
        }

        let input: Box<dyn BufRead + Send> = match self.target {
            ConsoleTarget::Stdio => Box::new(BufReader::new(std::io::stdin())),
            ConsoleTarget::Tty => Box::new(BufReader::new(File::open("/dev/tty")?)),
        };
        let started = LineReader::start(input)?;
        let lines = Arc::clone(&started.lines);
        *reader = Some(started);
        Ok(lines)
    }
}

impl SurfaceLauncher for ConsoleLauncher {
    fn launch(&self, request: &SessionRequest) -> std::io::Result<SessionSurface> {
        debug!(target_kind = ?self.target, project = %request.project_directory.display(), "Opening console surface");
        let lines = self.lines()?;
        let (surface, handle) = surface_pair();
        match self.target {
            ConsoleTarget::Stdio => spawn_shared(handle, lines, std::io::stderr())?,
            ConsoleTarget::Tty => {
                let output = OpenOptions::new().write(true).open("/dev/tty")?;
                spawn_shared(handle, lines, output)?
            }
        }
        Ok(surface)
    }
}

type SharedLines = Arc<Mutex<std::sync::mpsc::Receiver<String>>>;

/// Thread reading lines into a channel until end of input
#[derive(Debug)]
struct LineReader {
    lines: SharedLines,
    thread: thread::JoinHandle<()>,
}

impl LineReader {
    fn start(input: Box<dyn BufRead + Send>) -> std::io::Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = thread::Builder::new()
            .name("feedback-lines".to_string())
            .spawn(move || {
                for line in input.lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Console input failed");
                            return;
                        }
                    }
                }
                debug!("Console input reached end of input");
            })?;
        Ok(Self {
            lines: Arc::new(Mutex::new(rx)),
            thread,
        })
    }
}

/// One session's view of a shared line reader
///
/// Ends once the session closes, without taking another line.
struct SessionLines {
    lines: SharedLines,
    closed: Arc<AtomicBool>,
}

impl Iterator for SessionLines {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.closed.load(Ordering::Acquire) {
            let lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match lines.recv_timeout(INPUT_POLL_INTERVAL) {
                Ok(line) => return Some(Ok(line)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }
}

/// Config as the console last knew it
#[derive(Debug, Default)]
struct ConsoleState {
    config: ProjectConfig,
    running: bool,
}

type Shared<T> = Arc<Mutex<T>>;

/// Start the render and input threads for a surface
pub fn spawn_console<R, W>(handle: SurfaceHandle, input: R, output: W) -> std::io::Result<()>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    spawn_threads(handle, input.lines(), output, Arc::default())
}

/// Like [`spawn_console`], reading from a line reader shared across sessions
fn spawn_shared<W>(handle: SurfaceHandle, lines: SharedLines, output: W) -> std::io::Result<()>
where
    W: Write + Send + 'static,
{
    let closed: Arc<AtomicBool> = Arc::default();
    let lines = SessionLines {
        lines,
        closed: Arc::clone(&closed),
    };
    spawn_threads(handle, lines, output, closed)
}

fn spawn_threads<L, W>(
    handle: SurfaceHandle,
    lines: L,
    output: W,
    closed: Arc<AtomicBool>,
) -> std::io::Result<()>
where
    L: Iterator<Item = std::io::Result<String>> + Send + 'static,
    W: Write + Send + 'static,
{
    let SurfaceHandle { events, actions } = handle;
    let state: Shared<ConsoleState> = Arc::default();
    let output: Shared<W> = Arc::new(Mutex::new(output));
    let (opened_tx, opened_rx) = oneshot::channel();

    {
        let state = Arc::clone(&state);
        let output = Arc::clone(&output);
        let closed = Arc::clone(&closed);
        thread::Builder::new()
            .name("feedback-render".to_string())
            .spawn(move || render_loop(events, opened_tx, state, output, closed))?;
    }

    thread::Builder::new()
        .name("feedback-input".to_string())
        .spawn(move || input_loop(lines, opened_rx, actions, state, output, closed))?;

    Ok(())
}

fn write_out<W: Write>(output: &Shared<W>, text: &str) {
    let mut out = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn render_loop<W: Write>(
    mut events: mpsc::UnboundedReceiver<UiEvent>,
    opened: oneshot::Sender<()>,
    state: Shared<ConsoleState>,
    output: Shared<W>,
    closed: Arc<AtomicBool>,
) {
    let mut opened = Some(opened);
    while let Some(event) = events.blocking_recv() {
        match event {
            UiEvent::Opened(view) => {
                if let Ok(mut state) = state.lock() {
                    state.config =
                        ProjectConfig::new(view.command.clone(), view.execute_automatically);
                }
                let command = if view.command.is_empty() {
                    "(none)".to_string()
                } else {
                    view.command
                };
                write_out(
                    &output,
                    &format!(
                        "=== Feedback requested ===\n{}\n\nCommand: {}\nExecute automatically: {}\nType /help for commands.\n",
                        view.summary,
                        command,
                        if view.execute_automatically { "on" } else { "off" }
                    ),
                );
                if let Some(opened) = opened.take() {
                    let _ = opened.send(());
                }
            }
            UiEvent::StateChanged(SessionState::AwaitHumanStart) => {
                write_out(&output, "Type /run to run the command or /skip to go to feedback.\n");
            }
            UiEvent::StateChanged(_) => {}
            UiEvent::RunStarted { .. } => {
                if let Ok(mut state) = state.lock() {
                    state.running = true;
                }
                write_out(&output, "--- Console ---\n");
            }
            UiEvent::Output(text) => write_out(&output, &text),
            UiEvent::RunFinished(status) => {
                if let Ok(mut state) = state.lock() {
                    state.running = false;
                }
                write_out(&output, &format!("--- Run {} ---\n", status));
            }
            UiEvent::AwaitingFeedback { .. } => {
                write_out(
                    &output,
                    "Enter your feedback, then /send (or end input). /run runs again.\n",
                );
            }
            UiEvent::ConfigSaved(config) => {
                write_out(
                    &output,
                    &format!(
                        "Configuration saved (command: {:?}, execute automatically: {}).\n",
                        config.command, config.execute_automatically
                    ),
                );
            }
            UiEvent::Closed => break,
        }
    }
    closed.store(true, Ordering::Release);
}

fn input_loop<L, W>(
    lines: L,
    opened: oneshot::Receiver<()>,
    actions: mpsc::UnboundedSender<HumanAction>,
    state: Shared<ConsoleState>,
    output: Shared<W>,
    closed: Arc<AtomicBool>,
) where
    L: Iterator<Item = std::io::Result<String>>,
    W: Write,
{
    if opened.blocking_recv().is_err() {
        debug!("Session ended before it opened, ignoring input");
        return;
    }

    let current = |state: &Shared<ConsoleState>| {
        state
            .lock()
            .map(|s| s.config.clone())
            .unwrap_or_default()
    };
    let mut feedback: Vec<String> = Vec::new();

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Console input failed");
                break;
            }
        };
        if closed.load(Ordering::Acquire) {
            debug!("Session over, dropping console input");
            return;
        }

        let action = match parse_line(&line) {
            ConsoleCommand::Run => Some(HumanAction::Run(current(&state))),
            ConsoleCommand::Stop => Some(HumanAction::Cancel),
            ConsoleCommand::Skip => Some(HumanAction::Skip),
            ConsoleCommand::Save => Some(HumanAction::SaveConfig),
            ConsoleCommand::SetCommand(command) => {
                let config = match state.lock() {
                    Ok(mut s) => {
                        s.config.command = command;
                        s.config.clone()
                    }
                    Err(_) => continue,
                };
                Some(HumanAction::Edit(config))
            }
            ConsoleCommand::SetAuto(auto) => {
                let config = match state.lock() {
                    Ok(mut s) => {
                        s.config.execute_automatically = auto;
                        s.config.clone()
                    }
                    Err(_) => continue,
                };
                Some(HumanAction::Edit(config))
            }
            ConsoleCommand::Send => {
                let _ = actions.send(HumanAction::Submit {
                    config: current(&state),
                    feedback: feedback.join("\n"),
                });
                return;
            }
            ConsoleCommand::Help => {
                write_out(&output, &format!("{}\n", HELP));
                None
            }
            ConsoleCommand::Unknown(command) => {
                write_out(&output, &format!("Unknown command {}. Type /help.\n", command));
                None
            }
            ConsoleCommand::Text(text) => {
                feedback.push(text);
                None
            }
        };

        if let Some(action) = action {
            if actions.send(action).is_err() {
                // Session is over
                return;
            }
        }
    }

    if closed.load(Ordering::Acquire) {
        return;
    }
    let running = state.lock().map(|s| s.running).unwrap_or(false);
    debug!(running, "Console input ended, submitting feedback");
    let _ = actions.send(HumanAction::Submit {
        config: current(&state),
        feedback: feedback.join("\n"),
    });
}
