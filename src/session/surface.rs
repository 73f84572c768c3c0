//! UI surface contract
//!
//! The session never talks to a window directly. It emits [`UiEvent`]s and
//! awaits [`HumanAction`]s over a pair of channels; whatever renders the
//! session (console, GUI, a test script) holds the other end.

use tokio::sync::mpsc;

use crate::config::ProjectConfig;
use crate::runner::RunStatus;

use super::state::SessionState;

/// Initial view shown when a session opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewModel {
    pub summary: String,
    pub command: String,
    pub execute_automatically: bool,
}

/// Core → UI notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Session opened; render summary and editable config
    Opened(ViewModel),
    /// State machine moved
    StateChanged(SessionState),
    /// A run is starting (logs were reset)
    RunStarted { command: String },
    /// Output chunk to append, in process order
    Output(String),
    /// The run ended
    RunFinished(RunStatus),
    /// Waiting for the human to submit feedback
    AwaitingFeedback { logs: String },
    /// Config was written to the store
    ConfigSaved(ProjectConfig),
    /// Session is over; the surface may close
    Closed,
}

/// UI → core actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanAction {
    /// Human changed the command or auto-run flag
    Edit(ProjectConfig),
    /// Persist the current config immediately
    SaveConfig,
    /// Run (or re-run) with this config
    Run(ProjectConfig),
    /// Go to feedback without running
    Skip,
    /// Stop the running command
    Cancel,
    /// Final answer
    Submit {
        config: ProjectConfig,
        feedback: String,
    },
}

/// Core side of the surface, owned by the session
#[derive(Debug)]
pub struct SessionSurface {
    events: mpsc::UnboundedSender<UiEvent>,
    actions: mpsc::UnboundedReceiver<HumanAction>,
}

/// UI side of the surface
#[derive(Debug)]
pub struct SurfaceHandle {
    pub events: mpsc::UnboundedReceiver<UiEvent>,
    pub actions: mpsc::UnboundedSender<HumanAction>,
}

/// Create a connected pair of surface ends
pub fn surface_pair() -> (SessionSurface, SurfaceHandle) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    (
        SessionSurface {
            events: events_tx,
            actions: actions_rx,
        },
        SurfaceHandle {
            events: events_rx,
            actions: actions_tx,
        },
    )
}

impl SessionSurface {
    /// Send an event; a UI that went away is not an error
    pub fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }

    /// Wait for the next action; `None` once the UI dropped its sender
    pub async fn next_action(&mut self) -> Option<HumanAction> {
        self.actions.recv().await
    }
}

impl SurfaceHandle {
    /// Queue an action for the session
    pub fn send(&self, action: HumanAction) -> bool {
        self.actions.send(action).is_ok()
    }

    /// Wait for the next event; `None` once the session is gone
    pub async fn next_event(&mut self) -> Option<UiEvent> {
        self.events.recv().await
    }
}
