//! Tool Entry Point - the operation a calling assistant invokes
//!
//! Validates the request, opens a UI surface, drives one
//! [`FeedbackSession`](crate::session::FeedbackSession) to completion and returns
//! `{logs, interactive_feedback}`.

pub mod entry;

pub use entry::{
    tool_definition, validate_project_directory, FeedbackArguments, FeedbackTool,
    SurfaceLauncher, ToolDefinition, ToolError, TOOL_NAME,
};
