//! Backup tasks.
//!
//! The write lock is held only long enough to pin media and open the
//! snapshot connection; edits continue while the copy runs.
//!
//! # Invariants
//! - Manual backups are named `backup_<timestamp>`, automatic ones
//!   `auto_backup_<timestamp>`; pruning only ever touches the latter.
//! - The last automatic run is recorded only after its backup was written.

use super::{io_error, AutoBackupOutcome, BackupOutcome, LifecycleResult, OperationContext};
use crate::config::{AppSettings, AutoBackupPolicy, SettingsStore};
use crate::storage::swap::unique_path;
use crate::tree::NotebookTree;
use chrono::{Local, Utc};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

const MANUAL_PREFIX: &str = "backup_";
const AUTO_PREFIX: &str = "auto_backup_";

pub(super) fn run(
    tree: &NotebookTree,
    context: &mut OperationContext,
    destination_dir: &Path,
) -> LifecycleResult<BackupOutcome> {
    write_backup(tree, context, destination_dir, MANUAL_PREFIX)
}

/// Writes an automatic backup, records the run and prunes old ones.
pub(super) fn run_auto(
    tree: &NotebookTree,
    context: &mut OperationContext,
    destination_dir: &Path,
    policy: AutoBackupPolicy,
    settings: Option<&SettingsStore>,
) -> LifecycleResult<AutoBackupOutcome> {
    let started_at = Utc::now();
    let backup = write_backup(tree, context, destination_dir, AUTO_PREFIX)?;

    if let Some(settings) = settings {
        let mut next = settings
            .load()?
            .unwrap_or_else(|| AppSettings::new(tree.location()));
        next.last_auto_backup = Some(started_at);
        settings.save(&next)?;
    }
    let pruned = prune_auto_backups(destination_dir, policy.keep_count)?;
    info!(
        "event=auto_backup module=lifecycle status=ok kept={} pruned={}",
        policy.keep_count,
        pruned.len()
    );
    Ok(AutoBackupOutcome { backup, pruned })
}

fn write_backup(
    tree: &NotebookTree,
    context: &mut OperationContext,
    destination_dir: &Path,
    prefix: &str,
) -> LifecycleResult<BackupOutcome> {
    fs::create_dir_all(destination_dir)
        .map_err(|err| io_error(format!("create {}", destination_dir.display()), err))?;
    context.check_continue()?;

    let source = tree.lock_storage().snapshot_source()?;
    let name = format!("{prefix}{}", Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let path = unique_path(destination_dir.join(name));
    let manifest = source.write_to(&path, context)?;
    Ok(BackupOutcome { path, manifest })
}

/// Deletes the oldest `auto_backup_*` directories in `dir` beyond
/// `keep_count`. Names carry the timestamp, so name order is age order.
/// Returns the removed directories.
fn prune_auto_backups(dir: &Path, keep_count: usize) -> LifecycleResult<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).map_err(|err| io_error(format!("scan {}", dir.display()), err))?;
    let mut backups: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(AUTO_PREFIX))
        .map(|entry| entry.path())
        .collect();
    backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut pruned = Vec::new();
    for path in backups.into_iter().skip(keep_count) {
        match fs::remove_dir_all(&path) {
            Ok(()) => pruned.push(path),
            Err(err) => warn!(
                "event=auto_backup_prune module=lifecycle status=error path={} error={}",
                path.display(),
                err
            ),
        }
    }
    Ok(pruned)
}
