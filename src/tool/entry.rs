//! `interactive_feedback` tool

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::FileConfigStore;
use crate::runner::CommandRunner;
use crate::session::{FeedbackSession, SessionError, SessionRequest, SessionResult, SessionSurface};

/// Name the tool is exposed under
pub const TOOL_NAME: &str = "interactive_feedback";

const TOOL_DESCRIPTION: &str = "Request interactive feedback from the user for a project. \
Optionally re-runs the project's configured command first, then returns the captured \
logs together with the user's free-text feedback.";

/// Arguments of a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackArguments {
    /// Full path of the project directory
    pub project_directory: String,
    /// Short summary of the changes made
    pub summary: String,
}

/// Tool description for discovery
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Describe the tool: name, purpose and JSON Schema of its arguments
pub fn tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_NAME.to_string(),
        description: TOOL_DESCRIPTION.to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "project_directory": {
                    "type": "string",
                    "description": "Full path to the project directory"
                },
                "summary": {
                    "type": "string",
                    "description": "Short, one-line summary of the changes"
                }
            },
            "required": ["project_directory", "summary"]
        }),
    }
}

/// Error type for tool invocations
#[derive(Debug)]
pub enum ToolError {
    /// Bad arguments; no session was started
    Validation(String),
    /// The UI surface could not be opened
    Surface(std::io::Error),
    /// The session itself failed
    Session(SessionError),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Validation(msg) => write!(f, "Invalid request: {}", msg),
            ToolError::Surface(e) => write!(f, "Failed to open feedback UI: {}", e),
            ToolError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ToolError::Validation(_) => None,
            ToolError::Surface(e) => Some(e),
            ToolError::Session(e) => Some(e),
        }
    }
}

impl From<SessionError> for ToolError {
    fn from(e: SessionError) -> Self {
        ToolError::Session(e)
    }
}

/// Opens a fresh UI surface for each invocation
pub trait SurfaceLauncher: Send + Sync {
    fn launch(&self, request: &SessionRequest) -> std::io::Result<SessionSurface>;
}

impl<F> SurfaceLauncher for F
where
    F: Fn(&SessionRequest) -> std::io::Result<SessionSurface> + Send + Sync,
{
    fn launch(&self, request: &SessionRequest) -> std::io::Result<SessionSurface> {
        self(request)
    }
}

/// Check that the project directory exists and is a directory
///
/// Returns the canonical absolute path.
pub fn validate_project_directory(path: &Path) -> Result<PathBuf, ToolError> {
    if path.as_os_str().is_empty() {
        return Err(ToolError::Validation(
            "project_directory must not be empty".to_string(),
        ));
    }
    let canonical = path.canonicalize().map_err(|e| {
        ToolError::Validation(format!(
            "project_directory {} does not exist: {}",
            path.display(),
            e
        ))
    })?;
    if !canonical.is_dir() {
        return Err(ToolError::Validation(format!(
            "project_directory {} is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Entry point driving one independent session per call
#[derive(Clone)]
pub struct FeedbackTool {
    launcher: Arc<dyn SurfaceLauncher>,
    runner: CommandRunner,
}

impl FeedbackTool {
    pub fn new(launcher: Arc<dyn SurfaceLauncher>, runner: CommandRunner) -> Self {
        Self { launcher, runner }
    }

    /// Run a session for `project_directory`, blocking until the human is done
    pub async fn invoke(
        &self,
        project_directory: &str,
        summary: &str,
    ) -> Result<SessionResult, ToolError> {
        self.invoke_request(SessionRequest::new(project_directory, summary))
            .await
    }

    /// Same as [`invoke`](Self::invoke), with config overrides
    pub async fn invoke_request(&self, request: SessionRequest) -> Result<SessionResult, ToolError> {
        self.invoke_until(request, std::future::pending()).await
    }

    /// Run a session that an outer signal (e.g. a transport timeout) can abort
    pub async fn invoke_until<F>(
        &self,
        mut request: SessionRequest,
        abort: F,
    ) -> Result<SessionResult, ToolError>
    where
        F: Future<Output = ()>,
    {
        request.project_directory = validate_project_directory(&request.project_directory)?;

        let mut surface = self.launcher.launch(&request).map_err(ToolError::Surface)?;
        let store = FileConfigStore::new(request.project_directory.clone());
        let mut session = FeedbackSession::new(request, store, self.runner.clone());
        info!(session_id = %session.id(), "Feedback tool invoked");

        match session.run_until(&mut surface, abort).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Feedback session failed");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for FeedbackTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackTool")
            .field("runner", &self.runner)
            .finish()
    }
}
