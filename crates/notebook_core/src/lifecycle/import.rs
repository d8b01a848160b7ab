//! Import task.
//!
//! # Invariants
//! - Files are parsed before anything is written; the merge into the tree
//!   is a single transaction.
//! - One unparseable file never aborts the batch; it is counted as failed.
//! - Directories map to folders; folders with an existing name are reused.

use super::format::{parse_document, SourceKind};
use super::{
    ensure_exists, io_error, LifecycleError, LifecycleResult, OperationContext, TransferSummary,
    EXPORT_INFO_FILE,
};
use crate::policy::PathPolicy;
use crate::progress::{OperationPhase, ProgressSink};
use crate::tree::{ImportedNote, NotebookTree};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    kind: SourceKind,
    folder_path: Vec<String>,
    fallback_title: String,
}

#[derive(Debug, Default)]
struct SourceScan {
    folders: Vec<Vec<String>>,
    candidates: Vec<Candidate>,
    skipped: usize,
}

pub(super) fn run(
    tree: &NotebookTree,
    context: &mut OperationContext,
    source: &Path,
) -> LifecycleResult<TransferSummary> {
    ensure_exists(source)?;
    let scan = scan_source(source)?;
    if scan.candidates.is_empty() {
        return Err(LifecycleError::Integrity(format!(
            "no importable note files in {}",
            source.display()
        )));
    }
    context.check_continue()?;

    context.enter_phase(OperationPhase::Transferring);
    context.set_totals(scan.candidates.len() as u64, 0);
    let mut notes = Vec::with_capacity(scan.candidates.len());
    let mut failed = 0;
    for candidate in &scan.candidates {
        context.check_continue()?;
        let bytes = match fs::read(&candidate.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    "event=import_file module=lifecycle status=error path={} error={}",
                    candidate.path.display(),
                    err
                );
                failed += 1;
                context.advance(1, 0);
                continue;
            }
        };
        match parse_document(candidate.kind, &bytes, &candidate.fallback_title) {
            Ok(parsed) => notes.push(ImportedNote {
                folder_path: candidate.folder_path.clone(),
                title: parsed.title,
                body: parsed.body,
            }),
            Err(reason) => {
                warn!(
                    "event=import_file module=lifecycle status=error path={} error={}",
                    candidate.path.display(),
                    reason
                );
                failed += 1;
            }
        }
        context.advance(1, bytes.len() as u64);
    }

    context.enter_phase(OperationPhase::Verifying);
    context.check_continue()?;
    let policy = tree.policy();
    let before = notes.len();
    notes.retain(|note| fits(&policy, &note.folder_path, note.folder_path.len()));
    failed += before - notes.len();
    let folders: Vec<Vec<String>> = scan
        .folders
        .into_iter()
        .filter(|path| fits(&policy, path, path.len().saturating_sub(1)))
        .collect();

    context.check_continue()?;
    context.enter_phase(OperationPhase::Committing);
    let applied = tree.apply_import(&folders, &notes)?;
    failed += applied.rejected_notes;
    info!(
        "event=import_notes module=lifecycle status=ok notes={} folders={} skipped={} failed={}",
        applied.created_notes, applied.created_folders, scan.skipped, failed
    );
    Ok(TransferSummary {
        succeeded: applied.created_notes,
        skipped: scan.skipped,
        failed,
        output: source.to_path_buf(),
    })
}

/// Whether an item at `depth` under `folder_path` can be placed: the depth
/// is within the limit and every folder name is acceptable.
fn fits(policy: &PathPolicy, folder_path: &[String], depth: usize) -> bool {
    if depth > policy.max_depth() as usize {
        warn!(
            "event=import_verify module=lifecycle status=warn reason=too_deep depth={}",
            depth
        );
        return false;
    }
    folder_path
        .iter()
        .all(|segment| policy.validate_name(segment).is_ok())
}

fn scan_source(source: &Path) -> LifecycleResult<SourceScan> {
    let mut scan = SourceScan::default();
    if source.is_file() {
        match SourceKind::of(source) {
            Some(kind) => scan.candidates.push(candidate(source, kind, Vec::new())),
            None => scan.skipped += 1,
        }
        return Ok(scan);
    }

    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
    for entry in walker {
        let entry =
            entry.map_err(|err| io_error(format!("scan {}", source.display()), err.into()))?;
        let relative: Vec<String> = entry
            .path()
            .strip_prefix(source)
            .unwrap_or(entry.path())
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        if entry.file_type().is_dir() {
            scan.folders.push(relative);
            continue;
        }
        if entry.file_name() == EXPORT_INFO_FILE {
            continue;
        }
        let folder_path = relative[..relative.len().saturating_sub(1)].to_vec();
        match SourceKind::of(entry.path()) {
            Some(kind) => scan
                .candidates
                .push(candidate(entry.path(), kind, folder_path)),
            None => scan.skipped += 1,
        }
    }
    Ok(scan)
}

fn candidate(path: &Path, kind: SourceKind, folder_path: Vec<String>) -> Candidate {
    let fallback_title = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string());
    Candidate {
        path: path.to_path_buf(),
        kind,
        folder_path,
        fallback_title,
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}
