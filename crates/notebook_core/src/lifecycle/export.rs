//! Export task.
//!
//! # Invariants
//! - Notes are read inside one read transaction, so the export reflects a
//!   single committed state even while edits continue.
//! - Files are written to a sibling staging directory; the destination is
//!   replaced only after the written tree was checked.

use super::format::{file_stem_for, ExportFormat};
use super::{io_error, LifecycleError, LifecycleResult, OperationContext, TransferSummary};
use crate::model::item::ItemId;
use crate::progress::{OperationPhase, ProgressSink};
use crate::repo::item_repo::{ItemRepository, SqliteItemRepository};
use crate::storage::swap::{remove_dir_quiet, ScratchDir};
use crate::tree::snapshot::TreeSnapshot;
use crate::tree::NotebookTree;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

/// Summary file written at the top of every export.
pub const EXPORT_INFO_FILE: &str = "export_info.json";
const EXPORT_STAGING_PREFIX: &str = ".export-";
const EXPORT_PREVIOUS_PREFIX: &str = ".export-previous-";

#[derive(Debug, Serialize)]
struct ExportInfo {
    format: ExportFormat,
    app_version: String,
    exported_at: DateTime<Utc>,
    folder_count: usize,
    note_count: usize,
    failed_count: usize,
}

#[derive(Debug, Default)]
struct ExportCounts {
    folders: usize,
    notes: usize,
    failed: usize,
}

pub(super) fn run(
    tree: &NotebookTree,
    context: &mut OperationContext,
    format: ExportFormat,
    destination: &Path,
    overwrite: bool,
) -> LifecycleResult<TransferSummary> {
    if destination.is_file() || (has_entries(destination)? && !overwrite) {
        return Err(LifecycleError::Conflict(destination.to_path_buf()));
    }
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|err| io_error(format!("create {}", parent.display()), err))?;
    context.check_continue()?;

    let reader = tree.lock_storage().open_reader()?;
    let read = reader.unchecked_transaction()?;
    let repo = SqliteItemRepository::try_new(&read)?;
    let snapshot = TreeSnapshot::from_items(repo.load_items()?).map_err(LifecycleError::Integrity)?;

    context.enter_phase(OperationPhase::Transferring);
    let staging = ScratchDir::create(parent, EXPORT_STAGING_PREFIX)?;
    context.set_totals(snapshot.note_count() as u64, 0);
    let mut counts = ExportCounts::default();
    write_folder(
        &snapshot,
        &repo,
        snapshot.root_uuid(),
        staging.path(),
        format,
        context,
        &mut counts,
    )?;
    write_info(staging.path(), format, &counts)?;

    context.enter_phase(OperationPhase::Verifying);
    context.check_continue()?;
    let written = count_documents(staging.path(), format)?;
    if written != counts.notes {
        return Err(LifecycleError::Integrity(format!(
            "export wrote {written} documents, expected {}",
            counts.notes
        )));
    }

    context.check_continue()?;
    context.enter_phase(OperationPhase::Committing);
    publish(staging.path(), destination, parent)?;
    info!(
        "event=export_notes module=lifecycle status=ok format={} notes={} folders={} failed={}",
        format.as_str(),
        counts.notes,
        counts.folders,
        counts.failed
    );
    Ok(TransferSummary {
        succeeded: counts.notes,
        skipped: 0,
        failed: counts.failed,
        output: destination.to_path_buf(),
    })
}

fn write_folder(
    snapshot: &TreeSnapshot,
    repo: &SqliteItemRepository<'_>,
    folder_uuid: ItemId,
    dir: &Path,
    format: ExportFormat,
    context: &mut OperationContext,
    counts: &mut ExportCounts,
) -> LifecycleResult<()> {
    let mut taken = HashSet::new();
    for child in snapshot.children(folder_uuid) {
        context.check_continue()?;
        let stem = file_stem_for(&child.display_name);
        if child.is_folder() {
            let path = dir.join(claim_name(&mut taken, &stem, None));
            fs::create_dir(&path)
                .map_err(|err| io_error(format!("create {}", path.display()), err))?;
            counts.folders += 1;
            write_folder(snapshot, repo, child.item_uuid, &path, format, context, counts)?;
            continue;
        }

        let body = match repo.note_body(child.item_uuid) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    "event=export_note module=lifecycle status=error note_uuid={} error={}",
                    child.item_uuid, err
                );
                counts.failed += 1;
                context.advance(1, 0);
                continue;
            }
        };
        let rendered = format.render(&child.display_name, &body);
        let path = dir.join(claim_name(&mut taken, &stem, Some(format.extension())));
        fs::write(&path, rendered.as_bytes())
            .map_err(|err| io_error(format!("write {}", path.display()), err))?;
        counts.notes += 1;
        context.advance(1, rendered.len() as u64);
    }
    Ok(())
}

/// Picks `stem[.ext]`, or `stem (n)[.ext]` when an earlier sibling took it.
/// Names compare case-insensitively to stay distinct on every filesystem.
fn claim_name(taken: &mut HashSet<String>, stem: &str, extension: Option<&str>) -> String {
    let with_extension = |stem: &str| match extension {
        Some(extension) => format!("{stem}.{extension}"),
        None => stem.to_string(),
    };
    let mut name = with_extension(stem);
    let mut n = 2;
    while taken.contains(&name.to_lowercase()) {
        name = with_extension(&format!("{stem} ({n})"));
        n += 1;
    }
    taken.insert(name.to_lowercase());
    name
}

fn write_info(dir: &Path, format: ExportFormat, counts: &ExportCounts) -> LifecycleResult<()> {
    let info = ExportInfo {
        format,
        app_version: crate::core_version().to_string(),
        exported_at: Utc::now(),
        folder_count: counts.folders,
        note_count: counts.notes,
        failed_count: counts.failed,
    };
    let path = dir.join(EXPORT_INFO_FILE);
    let json = serde_json::to_vec_pretty(&info).map_err(io::Error::from);
    json.and_then(|json| fs::write(&path, json))
        .map_err(|err| io_error(format!("write {}", path.display()), err))
}

fn count_documents(dir: &Path, format: ExportFormat) -> LifecycleResult<usize> {
    let mut count = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|err| io_error(format!("scan {}", dir.display()), err.into()))?;
        let is_document = entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|extension| extension == format.extension());
        if is_document {
            count += 1;
        }
    }
    Ok(count)
}

fn has_entries(path: &Path) -> LifecycleResult<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(format!("read {}", path.display()), err)),
    }
}

/// Moves the staged export to `destination`, replacing what is there.
fn publish(staged: &Path, destination: &Path, parent: &Path) -> LifecycleResult<()> {
    if !destination.exists() {
        return fs::rename(staged, destination)
            .map_err(|err| io_error(format!("publish {}", destination.display()), err));
    }
    let previous = parent.join(format!("{EXPORT_PREVIOUS_PREFIX}{}", Uuid::new_v4()));
    fs::rename(destination, &previous)
        .map_err(|err| io_error(format!("move aside {}", destination.display()), err))?;
    if let Err(err) = fs::rename(staged, destination) {
        if let Err(restore_err) = fs::rename(&previous, destination) {
            warn!(
                "event=export_publish module=lifecycle status=error path={} error={}",
                previous.display(),
                restore_err
            );
        }
        return Err(io_error(format!("publish {}", destination.display()), err));
    }
    remove_dir_quiet(&previous);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::claim_name;
    use std::collections::HashSet;

    #[test]
    fn sibling_names_get_numbered_suffixes() {
        let mut taken = HashSet::new();
        assert_eq!(claim_name(&mut taken, "Plan", Some("md")), "Plan.md");
        assert_eq!(claim_name(&mut taken, "plan", Some("md")), "plan (2).md");
        assert_eq!(claim_name(&mut taken, "Plan", Some("md")), "Plan (3).md");
        assert_eq!(claim_name(&mut taken, "Plan", None), "Plan");
    }
}
