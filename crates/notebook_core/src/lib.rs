//! Notebook storage and lifecycle engine.
//!
//! A notebook is a tree of folders and notes kept in one directory: a
//! SQLite record store (`notes.db`) plus content-addressed media files
//! (`notes_media/`). This crate owns the tree invariants, the durable store
//! and the long-running lifecycle operations (backup, restore, export,
//! import, relocate).

pub mod config;
pub mod db;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod policy;
pub mod progress;
pub mod repo;
pub mod storage;
pub mod tree;

pub use config::{AppSettings, AutoBackupPolicy, ConfigError, NotebookConfig, SettingsStore};
pub use lifecycle::{
    AutoBackupOutcome, BackupOutcome, ExportFormat, LifecycleCoordinator, LifecycleError, LifecycleResult,
    OperationHandle, RelocateOutcome, RestoreOutcome, TransferSummary,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::item::{ItemId, ItemKind, NotebookItem};
pub use model::media::MediaAsset;
pub use policy::{PathPolicy, PolicyError};
pub use progress::{
    NoopSink, OperationId, OperationKind, OperationPhase, OperationProgress, ProgressSink,
};
pub use storage::{BackupManifest, StorageBackend, StorageError};
pub use tree::snapshot::TreeSnapshot;
pub use tree::{DeleteOutcome, NotebookTree, TreeError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
