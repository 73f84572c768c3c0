//! user-feedback - human-in-the-loop checkpoint for coding assistants
//!
//! An assistant calls one tool with a project directory and a summary of what
//! it did. The human sees the summary, optionally re-runs the project's
//! configured command with its output streamed live, and types free-text
//! feedback. The tool returns the captured logs and that feedback.
//!
//! # Modules
//!
//! - `config` - per-project `.user-feedback.json` (command, auto-run flag)
//! - `runner` - shell command in its own process group, merged output, cancellation
//! - `session` - the feedback state machine and its UI surface contract
//! - `tool` - the `interactive_feedback` entry point
//! - `console` - line-oriented terminal surface
//! - `mcp` - JSON-RPC 2.0 stdio server
//! - `tracing` - structured logging to stderr
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use user_feedback::{CommandRunner, ConsoleLauncher, ConsoleTarget, FeedbackTool};
//!
//! let tool = FeedbackTool::new(
//!     Arc::new(ConsoleLauncher::new(ConsoleTarget::Stdio)),
//!     CommandRunner::default(),
//! );
//! let result = tool.invoke("/path/to/project", "Fixed the flaky test").await?;
//! println!("{}", result.interactive_feedback);
//! ```

pub mod config;
pub mod console;
pub mod mcp;
pub mod runner;
pub mod session;
pub mod tool;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigStore, FileConfigStore, ProjectConfig};
pub use console::{ConsoleLauncher, ConsoleTarget};
pub use mcp::McpServer;
pub use runner::{CommandRunner, RunHandle, RunStatus, RunnerOptions};
pub use session::{FeedbackSession, SessionRequest, SessionResult};
pub use tool::{FeedbackTool, ToolError};
