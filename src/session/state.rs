//! Session state machine states
//!
//! ```text
//! Init ──(auto-run)──────────────► Running ──► AwaitHumanFeedback ──► Complete
//!   └──► AwaitHumanStart ──(run)──►   ▲              │
//!              │                      └────(re-run)──┘
//!              └──(skip)─────────────────► AwaitHumanFeedback
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Loading config and merging the request
    Init,
    /// Waiting for the human to run, edit or skip
    AwaitHumanStart,
    /// Command is running
    Running,
    /// Waiting for the feedback submission
    AwaitHumanFeedback,
    /// Terminal
    Complete,
}

impl SessionState {
    /// True for states that block on the human
    pub fn is_suspension_point(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitHumanStart | SessionState::Running | SessionState::AwaitHumanFeedback
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::AwaitHumanStart => "await_human_start",
            SessionState::Running => "running",
            SessionState::AwaitHumanFeedback => "await_human_feedback",
            SessionState::Complete => "complete",
        };
        write!(f, "{}", name)
    }
}
