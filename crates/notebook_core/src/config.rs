//! Notebook engine configuration and persisted application settings.
//!
//! # Responsibility
//! - Define tunables of the engine (`NotebookConfig`) with serde defaults.
//! - Persist the active notebook location (`SettingsStore`), which relocate
//!   rewrites when it switches the active store.
//! - Decide when an automatic backup is due (`AutoBackupPolicy`).
//!
//! # Invariants
//! - `1 <= max_depth <= MAX_DEPTH_LIMIT` and `progress_buffer >= 1` after `validate()`.
//! - Settings are written to a temp file and renamed into place.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default maximum folder nesting level.
pub const DEFAULT_MAX_DEPTH: u32 = 10;
/// Largest accepted `max_depth`; stored depths are `i32`.
pub const MAX_DEPTH_LIMIT: u32 = i32::MAX as u32;
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;
const DEFAULT_PROGRESS_BUFFER: usize = 64;
const DEFAULT_AUTO_BACKUP_INTERVAL_DAYS: u32 = 7;
const DEFAULT_AUTO_BACKUP_KEEP: usize = 5;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "config io error at `{}`: {source}", path.display()),
            Self::Parse { path, source } => {
                write!(f, "invalid config json at `{}`: {source}", path.display())
            }
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid(_) => None,
        }
    }
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotebookConfig {
    /// Deepest allowed item depth; children of the root are depth `0`.
    pub max_depth: u32,
    /// Reject sibling items sharing a display name.
    pub unique_sibling_names: bool,
    /// Minimum interval between two progress ticks of one operation.
    pub progress_interval_ms: u64,
    /// Capacity of each operation's progress channel.
    pub progress_buffer: usize,
    pub auto_backup: AutoBackupPolicy,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            unique_sibling_names: false,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
            auto_backup: AutoBackupPolicy::default(),
        }
    }
}

impl NotebookConfig {
    /// Loads and validates a JSON config file. Missing keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".to_string()));
        }
        if self.max_depth > MAX_DEPTH_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_depth must be at most {MAX_DEPTH_LIMIT}"
            )));
        }
        if self.progress_buffer == 0 {
            return Err(ConfigError::Invalid(
                "progress_buffer must be at least 1".to_string(),
            ));
        }
        if self.auto_backup.interval_days == 0 {
            return Err(ConfigError::Invalid(
                "auto_backup.interval_days must be at least 1".to_string(),
            ));
        }
        if self.auto_backup.keep_count == 0 {
            return Err(ConfigError::Invalid(
                "auto_backup.keep_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Schedule and retention of automatic backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBackupPolicy {
    pub enabled: bool,
    /// Days between two automatic backups.
    pub interval_days: u32,
    /// Automatic backups kept after pruning; manual backups are never pruned.
    pub keep_count: usize,
}

impl Default for AutoBackupPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_days: DEFAULT_AUTO_BACKUP_INTERVAL_DAYS,
            keep_count: DEFAULT_AUTO_BACKUP_KEEP,
        }
    }
}

impl AutoBackupPolicy {
    /// Whether a backup is due at `now` given the last automatic run.
    /// A last run in the future (clock moved back) is not due.
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match last_run {
            None => true,
            Some(last_run) => now - last_run >= Duration::days(i64::from(self.interval_days)),
        }
    }
}

/// Persisted application settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Directory holding `notes.db` and `notes_media/`.
    pub notebook_location: PathBuf,
    /// Where automatic backups go.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_location: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_auto_backup: Option<DateTime<Utc>>,
}

impl AppSettings {
    pub fn new(notebook_location: impl Into<PathBuf>) -> Self {
        Self {
            notebook_location: notebook_location.into(),
            backup_location: None,
            last_auto_backup: None,
        }
    }
}

/// JSON-file store for `AppSettings`.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when no settings were saved yet.
    pub fn load(&self) -> Result<Option<AppSettings>, ConfigError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Writes settings atomically (temp file + rename).
    pub fn save(&self, settings: &AppSettings) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let payload = serde_json::to_vec_pretty(settings).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}
