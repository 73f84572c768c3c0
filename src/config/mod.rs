//! Per-project configuration
//!
//! Each project directory carries at most one `.user-feedback.json` file holding
//! the command to run and whether it runs automatically when a session opens.
//!
//! ```text
//! <project>/.user-feedback.json
//! {
//!   "command": "cargo test",
//!   "execute_automatically": true
//! }
//! ```

pub mod store;

pub use store::{
    load, save, ConfigError, ConfigStore, FileConfigStore, MemoryConfigStore, ProjectConfig,
    CONFIG_FILE_NAME,
};
