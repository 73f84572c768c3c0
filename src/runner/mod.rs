//! Command Runner - supervise one shell command per session
//!
//! The configured command line is handed to the host shell in its own process
//! group, with stdout and stderr merged into a single pipe. A supervisor task
//! owns the child, forwards decoded output in byte order and reports the
//! terminal status.
//!
//! # Architecture
//!
//! ```text
//! CommandRunner::start()
//!        │
//!        ├── pipe(2) ──► /bin/sh -c <command>   (stdout + stderr → write end)
//!        │                  process group = child pid
//!        ▼
//!   supervisor task ── read end ──► RunEvent::Output ──► RunHandle
//!        │                                                  │
//!        ├── child.wait() ────────► RunEvent::Finished      │
//!        │                                                  │
//!        └── cancel (watch) ◄───────────────────────────────┘
//!              SIGTERM → grace period → SIGKILL
//! ```

pub mod handle;
pub mod output;
pub mod process;

pub use handle::{
    RunEvent, RunFailure, RunHandle, RunPoll, RunStatus, COMMAND_NOT_FOUND_EXIT_CODE,
};
pub use process::{group_alive, CommandRunner, RunnerError, RunnerOptions};
