//! Lifecycle coordinator: backup, restore, export, import and relocate.
//!
//! # Responsibility
//! - Run long operations on the blocking pool without stalling the caller.
//! - Enforce one running operation per notebook.
//! - Stream phase and progress updates and route cancellation requests.
//! - Run scheduled automatic backups with retention.
//!
//! # Invariants
//! - Every operation starts in `Preparing` and ends in exactly one of
//!   `Completed`, `Cancelled` or `Failed`.
//! - A second operation is refused with `Busy` while one is running.
//! - Cancellation is honored up to the commit step; once committing, the
//!   operation runs to completion or fails atomically.
//! - `shutdown` cancels running operations and every later one.

use crate::config::{AutoBackupPolicy, ConfigError, NotebookConfig, SettingsStore};
use crate::policy::PolicyError;
use crate::progress::{OperationId, OperationKind, OperationPhase, OperationProgress, ProgressSink};
use crate::repo::RepoError;
use crate::storage::{BackupManifest, StorageError};
use crate::tree::{ActiveOperation, NotebookTree, TreeError};
use chrono::Utc;
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod backup;
mod context;
mod export;
pub mod format;
mod import;
mod relocate;
mod restore;

pub(crate) use context::OperationContext;
pub use export::EXPORT_INFO_FILE;
pub use format::ExportFormat;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug)]
pub enum LifecycleError {
    /// Another operation is running on this notebook.
    Busy {
        running: OperationKind,
        operation_id: OperationId,
    },
    /// The operation already reached a terminal phase (or never existed).
    AlreadyCompleted(OperationId),
    Cancelled,
    Io { context: String, source: io::Error },
    Integrity(String),
    /// Destination holds data and overwrite was not requested.
    Conflict(PathBuf),
    Validation(PolicyError),
    Tree(TreeError),
    Storage(StorageError),
    Config(ConfigError),
    /// Operations need a Tokio runtime to run on.
    RuntimeUnavailable,
    /// The worker task panicked or was aborted.
    TaskFailed(String),
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy { running, .. } => {
                write!(f, "another operation is running: {}", running.as_str())
            }
            Self::AlreadyCompleted(id) => write!(f, "operation {id} is not running"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Integrity(message) => write!(f, "integrity check failed: {message}"),
            Self::Conflict(path) => {
                write!(f, "destination `{}` already holds data", path.display())
            }
            Self::Validation(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::RuntimeUnavailable => write!(f, "no async runtime available"),
            Self::TaskFailed(message) => write!(f, "operation task failed: {message}"),
        }
    }
}

impl Error for LifecycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Validation(err) => Some(err),
            Self::Tree(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for LifecycleError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Io { context, source } => Self::Io { context, source },
            StorageError::Integrity(message) => Self::Integrity(message),
            StorageError::Conflict(path) => Self::Conflict(path),
            StorageError::Cancelled => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}

impl From<TreeError> for LifecycleError {
    fn from(value: TreeError) -> Self {
        match value {
            TreeError::Validation(err) => Self::Validation(err),
            TreeError::Storage(err) => err.into(),
            other => Self::Tree(other),
        }
    }
}

impl From<RepoError> for LifecycleError {
    fn from(value: RepoError) -> Self {
        StorageError::from(value).into()
    }
}

impl From<PolicyError> for LifecycleError {
    fn from(value: PolicyError) -> Self {
        Self::Validation(value)
    }
}

impl From<ConfigError> for LifecycleError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<rusqlite::Error> for LifecycleError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.into())
    }
}

pub(crate) fn io_error(context: impl Into<String>, source: io::Error) -> LifecycleError {
    LifecycleError::Io {
        context: context.into(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupOutcome {
    /// Directory holding the new backup.
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

/// Result of an automatic backup run.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoBackupOutcome {
    pub backup: BackupOutcome,
    /// Older automatic backups removed by retention.
    pub pruned: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub manifest: BackupManifest,
}

/// Per-file counts of an export or import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Export directory, or the imported source.
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocateOutcome {
    pub previous_root: PathBuf,
    pub new_root: PathBuf,
}

/// Caller side of one running operation.
pub struct OperationHandle<T> {
    id: OperationId,
    kind: OperationKind,
    tree: Arc<NotebookTree>,
    progress: Option<mpsc::Receiver<OperationProgress>>,
    join: JoinHandle<LifecycleResult<T>>,
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> OperationHandle<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Next progress update; `None` once the operation finished.
    pub async fn next_progress(&mut self) -> Option<OperationProgress> {
        match self.progress.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    /// Requests cancellation of this operation.
    pub fn cancel(&self) -> LifecycleResult<()> {
        if self.tree.cancel_operation(self.id) {
            Ok(())
        } else {
            Err(LifecycleError::AlreadyCompleted(self.id))
        }
    }

    /// Waits for the result, discarding further progress.
    pub async fn wait(mut self) -> LifecycleResult<T> {
        self.progress = None;
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(LifecycleError::TaskFailed(err.to_string())),
        }
    }

    /// Feeds every progress update to `observer`, then returns the result.
    pub async fn wait_with_progress(
        mut self,
        mut observer: impl FnMut(&OperationProgress),
    ) -> LifecycleResult<T> {
        while let Some(progress) = self.next_progress().await {
            observer(&progress);
        }
        self.wait().await
    }
}

/// Starts lifecycle operations against one notebook.
#[derive(Debug)]
pub struct LifecycleCoordinator {
    tree: Arc<NotebookTree>,
    settings: Option<SettingsStore>,
    auto_backup: AutoBackupPolicy,
    progress_interval: Duration,
    progress_buffer: usize,
    shutdown: CancellationToken,
}

impl LifecycleCoordinator {
    pub fn new(tree: Arc<NotebookTree>, config: &NotebookConfig) -> Self {
        Self {
            tree,
            settings: None,
            auto_backup: config.auto_backup,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            progress_buffer: config.progress_buffer.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Settings rewritten by a successful relocate.
    pub fn with_settings(mut self, settings: SettingsStore) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn tree(&self) -> &Arc<NotebookTree> {
        &self.tree
    }

    /// Writes a new backup under `destination_dir/backup_<timestamp>`.
    pub fn backup(
        &self,
        destination_dir: impl Into<PathBuf>,
    ) -> LifecycleResult<OperationHandle<BackupOutcome>> {
        let destination_dir = destination_dir.into();
        self.spawn(OperationKind::Backup, move |tree, context| {
            backup::run(tree, context, &destination_dir)
        })
    }

    /// Starts an automatic backup into `destination_dir/auto_backup_<timestamp>`
    /// when the policy says one is due, judged by the last run recorded in
    /// the settings. Returns `None` when nothing is due.
    ///
    /// Without a settings store no run is remembered, so every call is due.
    pub fn auto_backup_if_due(
        &self,
        destination_dir: impl Into<PathBuf>,
    ) -> LifecycleResult<Option<OperationHandle<AutoBackupOutcome>>> {
        let last_run = match &self.settings {
            Some(settings) => settings
                .load()?
                .and_then(|saved| saved.last_auto_backup),
            None => None,
        };
        if !self.auto_backup.is_due(last_run, Utc::now()) {
            info!(
                "event=auto_backup module=lifecycle status=ok due=false enabled={}",
                self.auto_backup.enabled
            );
            return Ok(None);
        }
        let destination_dir = destination_dir.into();
        let policy = self.auto_backup;
        let settings = self.settings.clone();
        self.spawn(OperationKind::Backup, move |tree, context| {
            backup::run_auto(tree, context, &destination_dir, policy, settings.as_ref())
        })
        .map(Some)
    }

    /// Replaces the live notebook with a backup directory (or its
    /// `manifest.json`).
    pub fn restore_from(
        &self,
        source: impl Into<PathBuf>,
    ) -> LifecycleResult<OperationHandle<RestoreOutcome>> {
        let source = source.into();
        self.spawn(OperationKind::Restore, move |tree, context| {
            restore::run(tree, context, &source)
        })
    }

    /// Writes every note as a document file, folders as directories.
    pub fn export_notes(
        &self,
        format: ExportFormat,
        destination: impl Into<PathBuf>,
        overwrite: bool,
    ) -> LifecycleResult<OperationHandle<TransferSummary>> {
        let destination = destination.into();
        self.spawn(OperationKind::Export, move |tree, context| {
            export::run(tree, context, format, &destination, overwrite)
        })
    }

    /// Merges document files from `source` into the notebook.
    pub fn import_notes(
        &self,
        source: impl Into<PathBuf>,
    ) -> LifecycleResult<OperationHandle<TransferSummary>> {
        let source = source.into();
        self.spawn(OperationKind::Import, move |tree, context| {
            import::run(tree, context, &source)
        })
    }

    /// Moves the notebook to `new_root` and makes it the active store.
    pub fn relocate(
        &self,
        new_root: impl Into<PathBuf>,
        overwrite: bool,
    ) -> LifecycleResult<OperationHandle<RelocateOutcome>> {
        let new_root = new_root.into();
        let settings = self.settings.clone();
        self.spawn(OperationKind::Relocate, move |tree, context| {
            relocate::run(tree, context, &new_root, overwrite, settings.as_ref())
        })
    }

    /// Requests cancellation of the running operation `id`.
    pub fn cancel(&self, id: OperationId) -> LifecycleResult<()> {
        if self.tree.cancel_operation(id) {
            Ok(())
        } else {
            Err(LifecycleError::AlreadyCompleted(id))
        }
    }

    /// Cancels the running operation and every operation started later.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("event=lifecycle_shutdown module=lifecycle status=ok");
    }

    fn spawn<T, F>(&self, kind: OperationKind, work: F) -> LifecycleResult<OperationHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&NotebookTree, &mut OperationContext) -> LifecycleResult<T> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::RuntimeUnavailable)?;
        let id = Uuid::new_v4();
        let token = self.shutdown.child_token();
        let slot = self
            .tree
            .begin_operation(ActiveOperation {
                id,
                kind,
                token: token.clone(),
            })
            .map_err(|running| {
                warn!(
                    "event=operation_start module=lifecycle status=error kind={} error_code=busy running={}",
                    kind.as_str(),
                    running.kind.as_str()
                );
                LifecycleError::Busy {
                    running: running.kind,
                    operation_id: running.id,
                }
            })?;

        let (sender, receiver) = mpsc::channel(self.progress_buffer);
        let mut context = OperationContext::new(id, kind, sender, token, self.progress_interval);
        let tree = Arc::clone(&self.tree);
        let worker_tree = Arc::clone(&self.tree);
        info!(
            "event=operation_start module=lifecycle status=ok kind={} operation_id={}",
            kind.as_str(),
            id
        );

        let join = runtime.spawn_blocking(move || {
            context.enter_phase(OperationPhase::Preparing);
            let result = work(&worker_tree, &mut context);
            // The terminal report may wait on the receiver; free the slot first.
            drop(slot);
            finish(&mut context, &result);
            result
        });

        Ok(OperationHandle {
            id,
            kind,
            tree,
            progress: Some(receiver),
            join,
        })
    }
}

fn finish<T>(context: &mut OperationContext, result: &LifecycleResult<T>) {
    let kind = context.kind().as_str();
    match result {
        Ok(_) => {
            context.finish(OperationPhase::Completed, None);
            info!("event=operation_finish module=lifecycle status=ok kind={kind}");
        }
        Err(LifecycleError::Cancelled) => {
            context.finish(OperationPhase::Cancelled, None);
            info!("event=operation_finish module=lifecycle status=cancelled kind={kind}");
        }
        Err(err) => {
            let phase = context.phase().as_str();
            context.finish(OperationPhase::Failed, Some(err.to_string()));
            error!(
                "event=operation_finish module=lifecycle status=error kind={kind} phase={phase} error={err}"
            );
        }
    }
}

/// Fails with `NotFound` when `path` does not exist.
pub(crate) fn ensure_exists(path: &Path) -> LifecycleResult<()> {
    if path.exists() {
        return Ok(());
    }
    Err(io_error(
        format!("open {}", path.display()),
        io::Error::new(io::ErrorKind::NotFound, "path does not exist"),
    ))
}
