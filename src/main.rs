//! user-feedback CLI
//!
//! - `serve` speaks MCP over stdio; the human answers on the controlling terminal
//! - `run` opens one console session in the current terminal and prints the result

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use user_feedback::console::{ConsoleLauncher, ConsoleTarget};
use user_feedback::mcp::McpServer;
use user_feedback::runner::{CommandRunner, RunnerOptions};
use user_feedback::session::SessionRequest;
use user_feedback::tool::FeedbackTool;
use user_feedback::tracing::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "user-feedback", version, about = "Interactive feedback checkpoint for coding assistants")]
struct Cli {
    /// Emit logs on stderr as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Milliseconds between SIGTERM and SIGKILL when stopping a command
    #[arg(long, global = true, default_value_t = 1000)]
    grace_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the interactive_feedback tool over MCP stdio
    Serve,
    /// Run one feedback session in this terminal
    Run {
        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project_directory: Option<PathBuf>,
        /// Text shown to the human
        #[arg(long, default_value = "Give your feedback")]
        prompt: String,
        /// Override the configured command
        #[arg(long)]
        command: Option<String>,
        /// Run the command as soon as the session opens
        #[arg(long)]
        auto: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let runner = CommandRunner::new(RunnerOptions {
        grace_period: Duration::from_millis(cli.grace_ms),
        ..RunnerOptions::default()
    });

    match cli.command {
        Command::Serve => serve(runner).await,
        Command::Run {
            project_directory,
            prompt,
            command,
            auto,
        } => run(runner, project_directory, prompt, command, auto).await,
    }
}

async fn serve(runner: CommandRunner) -> ExitCode {
    let tool = FeedbackTool::new(Arc::new(ConsoleLauncher::new(ConsoleTarget::Tty)), runner);
    let server = McpServer::new(tool);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    match server.run(stdin, tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "MCP server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    runner: CommandRunner,
    project_directory: Option<PathBuf>,
    prompt: String,
    command: Option<String>,
    auto: bool,
) -> ExitCode {
    let project_directory = match project_directory {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "Cannot determine current directory");
                return ExitCode::FAILURE;
            }
        },
    };

    let mut request = SessionRequest::new(project_directory, prompt);
    if let Some(command) = command {
        request = request.with_command(command);
    }
    if auto {
        request = request.with_execute_automatically(true);
    }

    let tool = FeedbackTool::new(Arc::new(ConsoleLauncher::new(ConsoleTarget::Stdio)), runner);
    match tool.invoke_request(request).await {
        Ok(result) => {
            info!(cancelled = result.was_cancelled(), "Session finished");
            println!("\nFeedback received:\n{}", result.interactive_feedback);
            println!("\nLogs collected: \n{}", result.logs);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Feedback session failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
