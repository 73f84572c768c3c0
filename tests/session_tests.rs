//! Integration tests for feedback sessions and the tool entry point
//!
//! Sessions are driven by scripted surfaces: a task reacts to UI events the
//! way a human at a window would, and real commands run through `/bin/sh`.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use user_feedback::config::{
    self, ConfigError, ConfigStore, FileConfigStore, MemoryConfigStore, ProjectConfig,
};
use user_feedback::console::spawn_console;
use user_feedback::runner::{group_alive, CommandRunner, RunStatus};
use user_feedback::session::{
    surface_pair, FeedbackSession, HumanAction, SessionError, SessionRequest, SessionState,
    SessionSurface, SurfaceHandle, UiEvent,
};
use user_feedback::tool::{FeedbackTool, SurfaceLauncher, ToolError};

/// Drive `handle` with `script`, which maps an event to the actions it triggers
///
/// Returns every event seen, once the session closes.
fn script<F>(mut handle: SurfaceHandle, mut script: F) -> tokio::task::JoinHandle<Vec<UiEvent>>
where
    F: FnMut(&UiEvent) -> Vec<HumanAction> + Send + 'static,
{
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = handle.next_event().await {
            for action in script(&event) {
                handle.send(action);
            }
            let closed = event == UiEvent::Closed;
            seen.push(event);
            if closed {
                break;
            }
        }
        seen
    })
}

fn submit(config: ProjectConfig, feedback: &str) -> HumanAction {
    HumanAction::Submit {
        config,
        feedback: feedback.to_string(),
    }
}

/// Test that auto-run captures the command output with no human edits
#[tokio::test]
async fn test_auto_run_captures_output() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("echo OK", true);
    let store = MemoryConfigStore::with_config(stored.clone());
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "Added a health check"),
        store.clone(),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    let ui = script(handle, move |event| match event {
        UiEvent::AwaitingFeedback { .. } => vec![submit(stored.clone(), "")],
        _ => vec![],
    });

    let result = session.run(&mut surface).await.unwrap();
    assert!(result.logs.starts_with("$ echo OK\n"));
    assert!(result.logs.contains("OK\n"));
    assert!(result.logs.ends_with("\nProcess exited with code 0\n"));
    assert_eq!(result.interactive_feedback, "");
    assert_eq!(session.state(), SessionState::Complete);
    assert_eq!(store.save_count(), 0);

    let events = ui.await.unwrap();
    assert!(events.contains(&UiEvent::RunFinished(RunStatus::Succeeded)));
    assert!(events.contains(&UiEvent::Output("OK\n".to_string())));
}

/// Test that skipping goes straight to feedback with empty logs
#[tokio::test]
async fn test_skip_then_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryConfigStore::new();
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "Renamed a module"),
        &store,
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    handle.send(HumanAction::Skip);
    handle.send(submit(ProjectConfig::default(), "  Looks good, thanks!\n"));

    let result = session.run(&mut surface).await.unwrap();
    assert_eq!(result.logs, "");
    assert_eq!(result.interactive_feedback, "Looks good, thanks!");
    assert!(!result.was_cancelled());
    assert_eq!(store.save_count(), 0);
}

/// Test that a missing command still reaches feedback with a clear indication
#[tokio::test]
async fn test_command_not_found_reaches_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("no-such-command-for-feedback-tests", true);
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        MemoryConfigStore::with_config(stored.clone()),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    let ui = script(handle, move |event| match event {
        UiEvent::AwaitingFeedback { logs } => {
            assert!(logs.contains("Command not found"));
            vec![submit(stored.clone(), "the command is missing")]
        }
        _ => vec![],
    });

    let result = session.run(&mut surface).await.unwrap();
    assert!(result.logs.contains("Command not found (exit code 127)"));
    assert_eq!(result.interactive_feedback, "the command is missing");

    let events = ui.await.unwrap();
    assert!(events.contains(&UiEvent::StateChanged(SessionState::AwaitHumanFeedback)));
}

/// Test that cancelling a long run reaches feedback quickly
#[tokio::test]
async fn test_cancel_during_run() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("sleep 100", true);
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        MemoryConfigStore::with_config(stored.clone()),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    let cancelled_at = Arc::new(std::sync::Mutex::new(None::<Instant>));
    let awaited_after = Arc::new(std::sync::Mutex::new(None::<Duration>));
    let (cancelled, awaited) = (Arc::clone(&cancelled_at), Arc::clone(&awaited_after));
    let ui = script(handle, move |event| match event {
        UiEvent::RunStarted { .. } => {
            *cancelled.lock().unwrap() = Some(Instant::now());
            vec![HumanAction::Cancel]
        }
        UiEvent::AwaitingFeedback { .. } => {
            let started = cancelled.lock().unwrap().unwrap();
            *awaited.lock().unwrap() = Some(started.elapsed());
            vec![submit(stored.clone(), "stopped it")]
        }
        _ => vec![],
    });

    let result = session.run(&mut surface).await.unwrap();
    assert!(result.was_cancelled());
    assert!(result.logs.ends_with("\nProcess cancelled\n"));
    assert_eq!(result.interactive_feedback, "stopped it");

    ui.await.unwrap();
    let waited = awaited_after.lock().unwrap().unwrap();
    assert!(waited <= Duration::from_secs(2), "took {:?}", waited);
}

/// Test that submitting while the command runs stops it and completes
#[tokio::test]
async fn test_submit_during_run_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("sleep 100", true);
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        MemoryConfigStore::with_config(stored.clone()),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    let _ui = script(handle, move |event| match event {
        UiEvent::RunStarted { .. } => vec![submit(stored.clone(), "no need to wait")],
        _ => vec![],
    });

    let started = Instant::now();
    let result = session.run(&mut surface).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(result.was_cancelled());
    assert_eq!(result.interactive_feedback, "no need to wait");
}

/// Test that re-running resets the logs to the latest run
#[tokio::test]
async fn test_rerun_resets_logs() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryConfigStore::new();
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        &store,
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    let runs = Arc::new(AtomicUsize::new(0));
    let seen_runs = Arc::clone(&runs);
    let ui = script(handle, move |event| match event {
        UiEvent::StateChanged(SessionState::AwaitHumanStart) => {
            vec![HumanAction::Run(ProjectConfig::new("echo first", false))]
        }
        UiEvent::AwaitingFeedback { .. } => {
            if seen_runs.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![HumanAction::Run(ProjectConfig::new("echo second", false))]
            } else {
                vec![submit(ProjectConfig::new("echo second", false), "ok")]
            }
        }
        _ => vec![],
    });

    let result = session.run(&mut surface).await.unwrap();
    assert!(!result.logs.contains("first"));
    assert!(result.logs.starts_with("$ echo second\nsecond\n"));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    // The edited command differs from the stored default, so it is written back
    assert_eq!(store.stored(), Some(ProjectConfig::new("echo second", false)));

    ui.await.unwrap();
}

/// Test that an explicit run with no command is a validation error
#[tokio::test]
async fn test_explicit_run_with_empty_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        MemoryConfigStore::new(),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    handle.send(HumanAction::Run(ProjectConfig::new("   ", false)));

    let result = session.run(&mut surface).await;
    assert!(matches!(result, Err(SessionError::Validation(_))));
}

/// Config store whose writes always fail
struct ReadOnlyStore(ProjectConfig);

impl ConfigStore for ReadOnlyStore {
    fn load(&self) -> ProjectConfig {
        self.0.clone()
    }

    fn save(&self, _config: &ProjectConfig) -> Result<(), ConfigError> {
        Err(ConfigError::Write(
            config::CONFIG_FILE_NAME.into(),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        ))
    }
}

/// Test that an explicit save that cannot be written ends the session
#[tokio::test]
async fn test_save_failure_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        ReadOnlyStore(ProjectConfig::new("echo stored", false)),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    handle.send(HumanAction::Edit(ProjectConfig::new("cargo test", false)));
    handle.send(HumanAction::SaveConfig);

    let result = session.run(&mut surface).await;
    assert!(matches!(result, Err(SessionError::Config(_))), "{:?}", result);
}

/// Test that submitting edits that cannot be written ends the session
#[tokio::test]
async fn test_submit_save_failure_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        ReadOnlyStore(ProjectConfig::new("echo stored", false)),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    handle.send(HumanAction::Skip);
    handle.send(submit(ProjectConfig::new("cargo test", true), "edited"));

    let result = session.run(&mut surface).await;
    assert!(matches!(result, Err(SessionError::Config(_))), "{:?}", result);
}

/// Test that unedited input typed straight into the console keeps the stored config
#[tokio::test]
async fn test_console_input_keeps_stored_config() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("cargo test", false);
    config::save(dir.path(), &stored).unwrap();

    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        FileConfigStore::new(dir.path()),
        CommandRunner::default(),
    );
    let (mut surface, handle) = surface_pair();
    spawn_console(handle, std::io::Cursor::new("looks good\n"), std::io::sink()).unwrap();

    let result = session.run(&mut surface).await.unwrap();
    assert_eq!(result.interactive_feedback, "looks good");
    assert_eq!(config::load(dir.path()), stored);
}

/// Test that a run typed before the console rendered uses the stored command
#[tokio::test]
async fn test_console_early_run_uses_stored_command() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("echo stored", false);
    config::save(dir.path(), &stored).unwrap();

    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        FileConfigStore::new(dir.path()),
        CommandRunner::default(),
    );
    let (mut surface, handle) = surface_pair();
    spawn_console(handle, std::io::Cursor::new("/run\n"), std::io::sink()).unwrap();

    let result = session.run(&mut surface).await.unwrap();
    assert!(result.logs.starts_with("$ echo stored\n"), "{:?}", result.logs);
    assert_eq!(config::load(dir.path()), stored);
}

/// Test that two back-to-back sessions leave the second one's edits on disk
#[tokio::test]
async fn test_back_to_back_sessions_persist_latest_edit() {
    let dir = tempfile::tempdir().unwrap();

    for config in [
        ProjectConfig::new("echo first", false),
        ProjectConfig::new("cargo test", true),
    ] {
        let mut session = FeedbackSession::new(
            SessionRequest::new(dir.path(), "s"),
            FileConfigStore::new(dir.path()),
            CommandRunner::default(),
        );
        let (mut surface, handle) = surface_pair();
        handle.send(submit(config, "fine"));
        session.run(&mut surface).await.unwrap();
    }

    assert_eq!(config::load(dir.path()), ProjectConfig::new("cargo test", true));

    let raw = std::fs::read_to_string(dir.path().join(config::CONFIG_FILE_NAME)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["command"], "cargo test");
    assert_eq!(json["execute_automatically"], true);
}

/// Test that caller overrides seed the session and are saved once submitted
#[tokio::test]
async fn test_request_overrides_seed_session() {
    let dir = tempfile::tempdir().unwrap();
    config::save(dir.path(), &ProjectConfig::new("echo stored", false)).unwrap();

    let request = SessionRequest::new(dir.path(), "s")
        .with_command("echo override")
        .with_execute_automatically(true);
    let mut session = FeedbackSession::new(
        request,
        FileConfigStore::new(dir.path()),
        CommandRunner::default(),
    );
    assert_eq!(session.working_config(), &ProjectConfig::default());

    let (mut surface, handle) = surface_pair();
    let _ui = script(handle, |event| match event {
        UiEvent::AwaitingFeedback { .. } => {
            vec![submit(ProjectConfig::new("echo override", true), "")]
        }
        _ => vec![],
    });

    let result = session.run(&mut surface).await.unwrap();
    assert!(result.logs.starts_with("$ echo override\noverride\n"));
    assert!(!result.logs.contains("stored"));
    assert_eq!(config::load(dir.path()), ProjectConfig::new("echo override", true));
}

/// Test that closing the surface ends the session with empty feedback
#[tokio::test]
async fn test_closed_surface_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryConfigStore::with_config(ProjectConfig::new("sleep 100", true));
    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        &store,
        CommandRunner::default(),
    );

    let (mut surface, mut handle) = surface_pair();
    let closer = tokio::spawn(async move {
        while let Some(event) = handle.next_event().await {
            if matches!(event, UiEvent::RunStarted { .. }) {
                // Dropping the handle closes the window
                return;
            }
        }
    });

    let result = session.run(&mut surface).await.unwrap();
    closer.await.unwrap();
    assert_eq!(result.interactive_feedback, "");
    assert!(result.was_cancelled());
    assert_eq!(store.save_count(), 0);
}

/// Test that an outer abort kills the command and writes no config
#[tokio::test]
async fn test_abort_kills_process_and_skips_save() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ProjectConfig::new("echo $$ > shell.pid; exec sleep 100", true);
    config::save(dir.path(), &stored).unwrap();

    let mut session = FeedbackSession::new(
        SessionRequest::new(dir.path(), "s"),
        FileConfigStore::new(dir.path()),
        CommandRunner::default(),
    );

    let (mut surface, handle) = surface_pair();
    let _ui = script(handle, |event| match event {
        UiEvent::RunStarted { .. } => vec![HumanAction::Edit(ProjectConfig::new("echo edited", false))],
        _ => vec![],
    });

    let pid_file = dir.path().join("shell.pid");
    let abort = {
        let pid_file = pid_file.clone();
        async move {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !pid_file.exists() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    let result = session.run_until(&mut surface, abort).await;
    assert!(matches!(result, Err(SessionError::Aborted)));

    let pgid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while group_alive(pgid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!group_alive(pgid));
    assert_eq!(config::load(dir.path()), stored);
}

/// Test that the tool rejects a missing project directory before opening a UI
#[tokio::test]
async fn test_tool_rejects_missing_directory() {
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&launches);
    let launcher: Arc<dyn SurfaceLauncher> = Arc::new(move |_request: &SessionRequest| -> std::io::Result<SessionSurface> {
        counter.fetch_add(1, Ordering::SeqCst);
        let (surface, _handle) = surface_pair();
        Ok(surface)
    });
    let tool = FeedbackTool::new(launcher, CommandRunner::default());

    let result = tool.invoke("/definitely/not/a/project/dir", "s").await;
    assert!(matches!(result, Err(ToolError::Validation(_))));
    assert_eq!(launches.load(Ordering::SeqCst), 0);
}

/// Test a full tool invocation against a real project directory
#[tokio::test]
async fn test_tool_invoke_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    config::save(dir.path(), &ProjectConfig::new("echo from-tool", true)).unwrap();

    let launcher: Arc<dyn SurfaceLauncher> = Arc::new(|request: &SessionRequest| -> std::io::Result<SessionSurface> {
        assert!(Path::new(&request.project_directory).is_absolute());
        let (surface, handle) = surface_pair();
        let _ui = script(handle, |event| match event {
            UiEvent::AwaitingFeedback { .. } => {
                vec![submit(ProjectConfig::new("echo from-tool", true), "works")]
            }
            _ => vec![],
        });
        Ok(surface)
    });
    let tool = FeedbackTool::new(launcher, CommandRunner::default());

    let result = tool
        .invoke(&dir.path().to_string_lossy(), "Wired up the tool")
        .await
        .unwrap();
    assert!(result.logs.contains("from-tool\n"));
    assert_eq!(result.interactive_feedback, "works");

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["interactive_feedback"], "works");
    assert!(json.get("last_run").is_none());
}
