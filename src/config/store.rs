//! Config Store - load/save the per-project configuration record
//!
//! Loading never fails: an absent, unreadable or malformed file is treated as
//! "no prior configuration" and yields the defaults. Saving always overwrites
//! the whole record and surfaces I/O errors to the caller.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fixed file name, relative to the project directory
pub const CONFIG_FILE_NAME: &str = ".user-feedback.json";

/// Persisted configuration for one project directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Shell command line to execute (empty = nothing configured)
    #[serde(default, alias = "run_command")]
    pub command: String,
    /// Run the command without waiting for the human to press run
    #[serde(default)]
    pub execute_automatically: bool,
}

impl ProjectConfig {
    pub fn new(command: impl Into<String>, execute_automatically: bool) -> Self {
        Self {
            command: command.into(),
            execute_automatically,
        }
    }

    /// True when there is something to run
    pub fn has_command(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

/// Error type for config store operations
#[derive(Debug)]
pub enum ConfigError {
    /// The record could not be serialized
    Serialize(serde_json::Error),
    /// The file (or its temporary sibling) could not be written
    Write(PathBuf, std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Write(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Write(_, e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Storage for one project's configuration record
///
/// Sessions receive a store explicitly instead of touching the filesystem
/// themselves, so tests can substitute [`MemoryConfigStore`].
pub trait ConfigStore {
    /// Load the record, falling back to defaults on any read problem
    fn load(&self) -> ProjectConfig;

    /// Overwrite the record
    fn save(&self, config: &ProjectConfig) -> Result<(), ConfigError>;
}

/// Config store backed by `<project>/.user-feedback.json`
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    project_directory: PathBuf,
}

impl FileConfigStore {
    /// Create a store rooted at a project directory
    pub fn new(project_directory: impl Into<PathBuf>) -> Self {
        Self {
            project_directory: project_directory.into(),
        }
    }

    pub fn project_directory(&self) -> &Path {
        &self.project_directory
    }

    /// Full path to the config file
    pub fn path(&self) -> PathBuf {
        self.project_directory.join(CONFIG_FILE_NAME)
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> ProjectConfig {
        load(&self.project_directory)
    }

    fn save(&self, config: &ProjectConfig) -> Result<(), ConfigError> {
        save(&self.project_directory, config)
    }
}

/// Load the configuration for a project directory
pub fn load(project_directory: &Path) -> ProjectConfig {
    let path = project_directory.join(CONFIG_FILE_NAME);

    let json = match std::fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No config file, using defaults");
            return ProjectConfig::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable config file, using defaults");
            return ProjectConfig::default();
        }
    };

    match serde_json::from_str::<ProjectConfig>(&json) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed config file, using defaults");
            ProjectConfig::default()
        }
    }
}

/// Atomically overwrite the configuration for a project directory
///
/// The record is written to a temporary sibling, synced, then renamed over
/// the target so readers never observe a half-written file.
pub fn save(project_directory: &Path, config: &ProjectConfig) -> Result<(), ConfigError> {
    let path = project_directory.join(CONFIG_FILE_NAME);
    let tmp_path = project_directory.join(format!(
        "{}.{}.tmp",
        CONFIG_FILE_NAME,
        std::process::id()
    ));

    let mut json = serde_json::to_string_pretty(config)?;
    json.push('\n');

    let written = std::fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(json.as_bytes())?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ConfigError::Write(tmp_path, e));
    }

    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ConfigError::Write(path, e));
    }

    debug!(path = %path.display(), command = %config.command, auto = config.execute_automatically, "Config saved");
    Ok(())
}

/// In-memory config store
///
/// Clones share the same record, so a test can keep one clone to inspect
/// what a session saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<MemoryRecord>>,
}

#[derive(Debug, Default)]
struct MemoryRecord {
    config: Option<ProjectConfig>,
    saves: usize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a record
    pub fn with_config(config: ProjectConfig) -> Self {
        let store = Self::default();
        if let Ok(mut record) = store.inner.lock() {
            record.config = Some(config);
        }
        store
    }

    /// Last saved (or seeded) record, if any
    pub fn stored(&self) -> Option<ProjectConfig> {
        self.inner.lock().ok().and_then(|r| r.config.clone())
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|r| r.saves).unwrap_or(0)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> ProjectConfig {
        self.stored().unwrap_or_default()
    }

    fn save(&self, config: &ProjectConfig) -> Result<(), ConfigError> {
        let mut record = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        record.config = Some(config.clone());
        record.saves += 1;
        Ok(())
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for &S {
    fn load(&self) -> ProjectConfig {
        (**self).load()
    }

    fn save(&self, config: &ProjectConfig) -> Result<(), ConfigError> {
        (**self).save(config)
    }
}
