//! Feedback Session - one interactive round with the human
//!
//! Loads the project config, optionally runs the command, streams its output
//! to the surface and waits for the human's feedback. Command failures end up
//! in the logs; only invalid run requests and config save failures abort.

use std::future::Future;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, ConfigStore, ProjectConfig};
use crate::runner::{CommandRunner, RunEvent, RunFailure, RunStatus, RunnerError};

use super::state::SessionState;
use super::surface::{HumanAction, SessionSurface, UiEvent, ViewModel};

/// What the caller asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Project root; the command runs here and the config lives here
    pub project_directory: PathBuf,
    /// What the assistant did, shown to the human
    pub summary: String,
    /// Replaces the stored command for this session
    pub command: Option<String>,
    /// Replaces the stored auto-run flag for this session
    pub execute_automatically: Option<bool>,
}

impl SessionRequest {
    pub fn new(project_directory: impl Into<PathBuf>, summary: impl Into<String>) -> Self {
        Self {
            project_directory: project_directory.into(),
            summary: summary.into(),
            command: None,
            execute_automatically: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_execute_automatically(mut self, execute_automatically: bool) -> Self {
        self.execute_automatically = Some(execute_automatically);
        self
    }

    /// Seed the session's working config from the stored one
    pub fn merge(&self, stored: &ProjectConfig) -> ProjectConfig {
        ProjectConfig {
            command: self.command.clone().unwrap_or_else(|| stored.command.clone()),
            execute_automatically: self
                .execute_automatically
                .unwrap_or(stored.execute_automatically),
        }
    }
}

/// What the session hands back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionResult {
    /// Output of the last run, with its `$ command` line and exit marker
    pub logs: String,
    /// Trimmed feedback text; empty if none was given
    pub interactive_feedback: String,
    /// How the last run ended (`Idle` if nothing ran)
    #[serde(skip)]
    pub last_run: RunStatus,
}

impl SessionResult {
    pub fn was_cancelled(&self) -> bool {
        self.last_run == RunStatus::Cancelled
    }
}

/// Error type for session operations
#[derive(Debug)]
pub enum SessionError {
    /// Explicit run requested with an empty or unusable command
    Validation(String),
    /// Config could not be saved
    Config(ConfigError),
    /// Session abandoned by an outer cancellation signal
    Aborted,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SessionError::Config(e) => write!(f, "Config error: {}", e),
            SessionError::Aborted => write!(f, "Session aborted"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(e)
    }
}

/// One feedback round, driven to completion by [`FeedbackSession::run`]
pub struct FeedbackSession<S: ConfigStore> {
    id: String,
    request: SessionRequest,
    store: S,
    runner: CommandRunner,
    state: SessionState,
    /// Config as last loaded or saved
    baseline: ProjectConfig,
    /// Config as currently edited by the human
    working: ProjectConfig,
    logs: String,
    last_run: RunStatus,
    /// Set on submission; `None` at completion means the surface went away
    feedback: Option<String>,
}

impl<S: ConfigStore> FeedbackSession<S> {
    pub fn new(request: SessionRequest, store: S, runner: CommandRunner) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            request,
            store,
            runner,
            state: SessionState::Init,
            baseline: ProjectConfig::default(),
            working: ProjectConfig::default(),
            logs: String::new(),
            last_run: RunStatus::Idle,
            feedback: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The config as the human currently has it
    pub fn working_config(&self) -> &ProjectConfig {
        &self.working
    }

    /// Drive the state machine until the human submits (or the UI closes)
    pub async fn run(&mut self, surface: &mut SessionSurface) -> Result<SessionResult, SessionError> {
        let span = info_span!(
            "feedback_session",
            session_id = %self.id,
            project = %self.request.project_directory.display(),
        );
        let result = self.drive(surface).instrument(span).await;
        surface.emit(UiEvent::Closed);
        result
    }

    /// Like [`run`](Self::run), but give up as soon as `abort` resolves
    ///
    /// Abandoning drops the in-flight run, which kills its process group.
    /// Nothing is written to the config store.
    pub async fn run_until<F>(
        &mut self,
        surface: &mut SessionSurface,
        abort: F,
    ) -> Result<SessionResult, SessionError>
    where
        F: Future<Output = ()>,
    {
        let id = self.id.clone();
        tokio::select! {
            result = self.run(surface) => result,
            _ = abort => {
                warn!(session_id = %id, "Session aborted by outer signal");
                surface.emit(UiEvent::Closed);
                Err(SessionError::Aborted)
            }
        }
    }

    async fn drive(&mut self, surface: &mut SessionSurface) -> Result<SessionResult, SessionError> {
        loop {
            let next = match self.state {
                SessionState::Init => self.init(surface),
                SessionState::AwaitHumanStart => self.await_start(surface).await?,
                SessionState::Running => self.run_command(surface).await?,
                SessionState::AwaitHumanFeedback => self.await_feedback(surface).await?,
                SessionState::Complete => break,
            };
            self.transition(next, surface);
        }

        if self.feedback.is_none() {
            info!("Surface closed without feedback");
        }
        Ok(SessionResult {
            logs: self.logs.clone(),
            interactive_feedback: self.feedback.clone().unwrap_or_default(),
            last_run: self.last_run.clone(),
        })
    }

    fn transition(&mut self, next: SessionState, surface: &SessionSurface) {
        if next != self.state {
            debug!(from = %self.state, to = %next, "Session state change");
            self.state = next;
            surface.emit(UiEvent::StateChanged(next));
        }
    }

    fn init(&mut self, surface: &SessionSurface) -> SessionState {
        self.baseline = self.store.load();
        self.working = self.request.merge(&self.baseline);
        info!(
            command = %self.working.command,
            auto = self.working.execute_automatically,
            "Session opened"
        );

        surface.emit(UiEvent::Opened(ViewModel {
            summary: self.request.summary.clone(),
            command: self.working.command.clone(),
            execute_automatically: self.working.execute_automatically,
        }));

        if !self.working.execute_automatically {
            return SessionState::AwaitHumanStart;
        }
        if !self.working.has_command() {
            warn!("Auto-run enabled but no command configured");
            return SessionState::AwaitHumanStart;
        }
        SessionState::Running
    }

    async fn await_start(&mut self, surface: &mut SessionSurface) -> Result<SessionState, SessionError> {
        loop {
            let Some(action) = surface.next_action().await else {
                return Ok(SessionState::Complete);
            };
            match action {
                HumanAction::Edit(config) => self.working = config,
                HumanAction::SaveConfig => self.save_config(surface)?,
                HumanAction::Run(config) => {
                    self.working = config;
                    self.validate_run()?;
                    return Ok(SessionState::Running);
                }
                HumanAction::Skip => {
                    self.logs.clear();
                    return Ok(SessionState::AwaitHumanFeedback);
                }
                HumanAction::Cancel => debug!("Nothing running, ignoring cancel"),
                HumanAction::Submit { config, feedback } => {
                    self.working = config;
                    self.submit(feedback, surface)?;
                    return Ok(SessionState::Complete);
                }
            }
        }
    }

    async fn await_feedback(&mut self, surface: &mut SessionSurface) -> Result<SessionState, SessionError> {
        surface.emit(UiEvent::AwaitingFeedback {
            logs: self.logs.clone(),
        });

        loop {
            let Some(action) = surface.next_action().await else {
                return Ok(SessionState::Complete);
            };
            match action {
                HumanAction::Edit(config) => self.working = config,
                HumanAction::SaveConfig => self.save_config(surface)?,
                HumanAction::Run(config) => {
                    self.working = config;
                    self.validate_run()?;
                    return Ok(SessionState::Running);
                }
                HumanAction::Skip | HumanAction::Cancel => debug!("Nothing to skip or cancel"),
                HumanAction::Submit { config, feedback } => {
                    self.working = config;
                    self.submit(feedback, surface)?;
                    return Ok(SessionState::Complete);
                }
            }
        }
    }

    async fn run_command(&mut self, surface: &mut SessionSurface) -> Result<SessionState, SessionError> {
        let command = self.working.command.clone();
        self.logs.clear();
        self.last_run = RunStatus::Running;
        surface.emit(UiEvent::RunStarted {
            command: command.clone(),
        });
        self.append(format!("$ {}\n", command), surface);

        let mut handle = match self.runner.start(&command, &self.request.project_directory) {
            Ok(handle) => handle,
            Err(RunnerError::InvalidCommand(reason)) => {
                return Err(SessionError::Validation(reason));
            }
            Err(e) => {
                warn!(error = %e, "Command could not be started");
                self.finish_run(RunStatus::Failed(RunFailure::Spawn(e.to_string())), surface);
                return Ok(SessionState::AwaitHumanFeedback);
            }
        };

        let mut submitted: Option<String> = None;
        let mut surface_open = true;

        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(RunEvent::Output(chunk)) => self.append(chunk, surface),
                    Some(RunEvent::Finished(_)) | None => break,
                },
                action = surface.next_action(), if surface_open => match action {
                    None => {
                        info!("Surface closed while running, cancelling");
                        surface_open = false;
                        handle.request_cancel();
                    }
                    Some(HumanAction::Cancel) => {
                        info!("Human requested cancellation");
                        handle.request_cancel();
                    }
                    Some(HumanAction::Submit { config, feedback }) => {
                        info!("Feedback submitted while running, cancelling");
                        self.working = config;
                        submitted = Some(feedback);
                        handle.request_cancel();
                    }
                    Some(HumanAction::Edit(config)) => self.working = config,
                    Some(HumanAction::SaveConfig) => self.save_config(surface)?,
                    Some(HumanAction::Run(config)) => {
                        debug!("Already running, keeping edits only");
                        self.working = config;
                    }
                    Some(HumanAction::Skip) => debug!("Already running, ignoring skip"),
                },
            }
        }

        self.finish_run(handle.status().clone(), surface);

        if let Some(feedback) = submitted {
            self.submit(feedback, surface)?;
            return Ok(SessionState::Complete);
        }
        if !surface_open {
            return Ok(SessionState::Complete);
        }
        Ok(SessionState::AwaitHumanFeedback)
    }

    fn finish_run(&mut self, status: RunStatus, surface: &SessionSurface) {
        if let Some(marker) = status.marker() {
            self.append(format!("\n{}\n", marker), surface);
        }
        info!(status = %status, exit_code = ?status.exit_code(), "Run finished");
        surface.emit(UiEvent::RunFinished(status.clone()));
        self.last_run = status;
    }

    fn append(&mut self, text: String, surface: &SessionSurface) {
        self.logs.push_str(&text);
        surface.emit(UiEvent::Output(text));
    }

    fn validate_run(&self) -> Result<(), SessionError> {
        CommandRunner::validate(&self.working.command).map_err(|e| match e {
            RunnerError::InvalidCommand(reason) => SessionError::Validation(reason),
            other => SessionError::Validation(other.to_string()),
        })
    }

    fn save_config(&mut self, surface: &SessionSurface) -> Result<(), SessionError> {
        self.store.save(&self.working)?;
        self.baseline = self.working.clone();
        info!(command = %self.working.command, auto = self.working.execute_automatically, "Config saved");
        surface.emit(UiEvent::ConfigSaved(self.working.clone()));
        Ok(())
    }

    /// Record the feedback and write back any config edits
    fn submit(&mut self, feedback: String, surface: &SessionSurface) -> Result<(), SessionError> {
        if self.working != self.baseline {
            self.save_config(surface)?;
        }
        let feedback = feedback.trim().to_string();
        info!(feedback_len = feedback.len(), "Feedback submitted");
        self.feedback = Some(feedback);
        Ok(())
    }
}

impl<S: ConfigStore> std::fmt::Debug for FeedbackSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackSession")
            .field("id", &self.id)
            .field("project_directory", &self.request.project_directory)
            .field("state", &self.state)
            .field("working", &self.working)
            .field("last_run", &self.last_run)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::session::surface::surface_pair;

    fn session(store: MemoryConfigStore) -> FeedbackSession<MemoryConfigStore> {
        FeedbackSession::new(
            SessionRequest::new(std::env::temp_dir(), "Refactored the parser"),
            store,
            CommandRunner::default(),
        )
    }

    #[test]
    fn test_request_merge_prefers_overrides() {
        let stored = ProjectConfig::new("make", true);

        let request = SessionRequest::new("/tmp", "s");
        assert_eq!(request.merge(&stored), stored);

        let request = SessionRequest::new("/tmp", "s")
            .with_command("make test")
            .with_execute_automatically(false);
        assert_eq!(request.merge(&stored), ProjectConfig::new("make test", false));
    }

    #[test]
    fn test_result_serializes_protocol_keys_only() {
        let result = SessionResult {
            logs: "$ true\n".to_string(),
            interactive_feedback: "ship it".to_string(),
            last_run: RunStatus::Succeeded,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["logs"], "$ true\n");
        assert_eq!(value["interactive_feedback"], "ship it");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_skip_then_submit_without_edits() {
        let store = MemoryConfigStore::new();
        let mut session = session(store.clone());
        let (mut surface, mut ui) = surface_pair();

        ui.send(HumanAction::Skip);
        ui.send(HumanAction::Submit {
            config: ProjectConfig::default(),
            feedback: "  looks good \n".to_string(),
        });

        let result = session.run(&mut surface).await.unwrap();
        assert_eq!(result.logs, "");
        assert_eq!(result.interactive_feedback, "looks good");
        assert_eq!(result.last_run, RunStatus::Idle);
        assert_eq!(session.state(), SessionState::Complete);

        // Unchanged config is not rewritten
        assert_eq!(store.save_count(), 0);

        match ui.next_event().await {
            Some(UiEvent::Opened(view)) => {
                assert_eq!(view.summary, "Refactored the parser");
                assert_eq!(view.command, "");
                assert!(!view.execute_automatically);
            }
            other => panic!("expected Opened, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_explicit_run_with_empty_command_is_rejected() {
        let mut session = session(MemoryConfigStore::new());
        let (mut surface, ui) = surface_pair();

        ui.send(HumanAction::Run(ProjectConfig::new("   ", false)));

        let err = session.run(&mut surface).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_save_config_action_persists_immediately() {
        let store = MemoryConfigStore::new();
        let mut session = session(store.clone());
        let (mut surface, ui) = surface_pair();

        ui.send(HumanAction::Edit(ProjectConfig::new("cargo check", true)));
        ui.send(HumanAction::SaveConfig);
        ui.send(HumanAction::Submit {
            config: ProjectConfig::new("cargo check", true),
            feedback: String::new(),
        });

        let result = session.run(&mut surface).await.unwrap();
        assert_eq!(result.interactive_feedback, "");
        assert_eq!(store.stored(), Some(ProjectConfig::new("cargo check", true)));
        // Submit with an already-saved config does not save twice
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_surface_returns_empty_feedback_without_saving() {
        let store = MemoryConfigStore::with_config(ProjectConfig::new("true", false));
        let mut session = session(store.clone());
        let (mut surface, ui) = surface_pair();

        ui.send(HumanAction::Edit(ProjectConfig::new("false", true)));
        drop(ui);

        let result = session.run(&mut surface).await.unwrap();
        assert_eq!(result.interactive_feedback, "");
        assert_eq!(store.save_count(), 0);
        assert_eq!(store.stored(), Some(ProjectConfig::new("true", false)));
    }

    #[tokio::test]
    async fn test_auto_run_with_empty_command_waits_for_human() {
        let store = MemoryConfigStore::with_config(ProjectConfig::new("", true));
        let mut session = session(store);
        let (mut surface, mut ui) = surface_pair();

        ui.send(HumanAction::Skip);
        ui.send(HumanAction::Submit {
            config: ProjectConfig::new("", true),
            feedback: "ok".to_string(),
        });
        session.run(&mut surface).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = ui.events.try_recv() {
            if let UiEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                SessionState::AwaitHumanStart,
                SessionState::AwaitHumanFeedback,
                SessionState::Complete
            ]
        );
    }
}
