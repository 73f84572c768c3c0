//! Feedback Session orchestration
//!
//! A session is one round trip from the assistant to the human and back.
//!
//! # Architecture
//!
//! ```text
//! SessionRequest ──► FeedbackSession ──load──► ConfigStore
//!                          │
//!                          ├── UiEvent ───────► surface (console, GUI, test)
//!                          │◄── HumanAction ──┘
//!                          │
//!                          ├── start/cancel ──► CommandRunner ──► /bin/sh -c
//!                          │◄── RunEvent ─────┘
//!                          │
//!                          └──save (if edited)──► ConfigStore
//!                          ▼
//!                    SessionResult { logs, interactive_feedback }
//! ```

pub mod feedback;
pub mod state;
pub mod surface;

pub use feedback::{FeedbackSession, SessionError, SessionRequest, SessionResult};
pub use state::SessionState;
pub use surface::{surface_pair, HumanAction, SessionSurface, SurfaceHandle, UiEvent, ViewModel};
