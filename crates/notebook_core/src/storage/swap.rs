//! Staging directories and the atomic store swap.
//!
//! # Responsibility
//! - Create staging copies next to the live store and clean them up.
//! - Replace a live store with a verified staging copy, rolling back on
//!   failure and recovering an interrupted swap on the next open.
//!
//! # Invariants
//! - While `.swap-previous/SWAP_IN_PROGRESS` exists, the files inside
//!   `.swap-previous` are the authoritative store.
//! - Removing the marker is the commit point of a swap.

use super::layout::{
    NotebookLayout, MEDIA_DIR, RECORD_STORE_FILE, RECORD_STORE_SIDE_SUFFIXES, STAGING_PREFIX,
    SWAP_MARKER_FILE,
};
use super::{io_error, StorageResult};
use log::{error, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Staging directory removed on drop.
#[derive(Debug)]
pub(crate) struct StagingDir {
    layout: NotebookLayout,
}

impl StagingDir {
    /// Creates `<parent>/.staging-<uuid>/notes_media/`.
    pub(crate) fn create(parent: &Path) -> StorageResult<Self> {
        let path = parent.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        let layout = NotebookLayout::new(path);
        fs::create_dir_all(layout.media_dir())
            .map_err(|err| io_error(format!("create {}", layout.root().display()), err))?;
        Ok(Self { layout })
    }

    pub(crate) fn layout(&self) -> &NotebookLayout {
        &self.layout
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        remove_dir_quiet(self.layout.root());
    }
}

/// Plain scratch directory removed on drop, unless it was renamed away.
#[derive(Debug)]
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub(crate) fn create(parent: &Path, prefix: &str) -> StorageResult<Self> {
        let path = parent.join(format!("{prefix}{}", Uuid::new_v4()));
        fs::create_dir_all(&path)
            .map_err(|err| io_error(format!("create {}", path.display()), err))?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        remove_dir_quiet(&self.path);
    }
}

/// Entries that make up a store, relative to its root.
fn store_entries() -> Vec<String> {
    let mut entries = vec![RECORD_STORE_FILE.to_string()];
    for suffix in RECORD_STORE_SIDE_SUFFIXES {
        entries.push(format!("{RECORD_STORE_FILE}{suffix}"));
    }
    entries.push(MEDIA_DIR.to_string());
    entries
}

/// Replaces the store at `target` with the one in `staged`.
///
/// `activate` opens the swapped-in store; if it fails, the previous store
/// is put back and the error is returned. No connection may be open on
/// the target store during the call.
pub(crate) fn swap_into_place<T>(
    target: &NotebookLayout,
    staged: &NotebookLayout,
    activate: impl FnOnce(&NotebookLayout) -> StorageResult<T>,
) -> StorageResult<T> {
    let previous = target.swap_previous_dir();
    if previous.exists() {
        recover_interrupted_swap(target)?;
    }
    fs::create_dir_all(&previous)
        .map_err(|err| io_error(format!("create {}", previous.display()), err))?;
    let existed: Vec<String> = store_entries()
        .into_iter()
        .filter(|entry| target.root().join(entry).exists())
        .collect();
    fs::write(previous.join(SWAP_MARKER_FILE), existed.join("\n"))
        .map_err(|err| io_error("write swap marker", err))?;

    if let Err(err) = move_store(target.root(), &previous) {
        error!(
            "event=store_swap module=storage status=error stage=set_aside root={} error={}",
            target.root().display(),
            err
        );
        recover_interrupted_swap(target)?;
        return Err(err);
    }
    if let Err(err) = move_store(staged.root(), target.root()) {
        error!(
            "event=store_swap module=storage status=error stage=move_in root={} error={}",
            target.root().display(),
            err
        );
        recover_interrupted_swap(target)?;
        return Err(err);
    }

    let activated = match activate(target) {
        Ok(value) => value,
        Err(err) => {
            error!(
                "event=store_swap module=storage status=error stage=activate root={} error={}",
                target.root().display(),
                err
            );
            recover_interrupted_swap(target)?;
            return Err(err);
        }
    };

    fs::remove_file(previous.join(SWAP_MARKER_FILE))
        .map_err(|err| io_error("remove swap marker", err))?;
    remove_dir_quiet(&previous);
    info!(
        "event=store_swap module=storage status=ok root={}",
        target.root().display()
    );
    Ok(activated)
}

/// Restores the previous store if a swap was interrupted, then removes
/// leftovers of earlier runs.
pub(crate) fn recover_interrupted_swap(target: &NotebookLayout) -> StorageResult<()> {
    let previous = target.swap_previous_dir();
    let marker = previous.join(SWAP_MARKER_FILE);
    if marker.exists() {
        warn!(
            "event=store_swap_recover module=storage status=start root={}",
            target.root().display()
        );
        let existed = fs::read_to_string(&marker)
            .map_err(|err| io_error("read swap marker", err))?;
        let existed: Vec<&str> = existed.lines().collect();
        for entry in store_entries() {
            let live = target.root().join(&entry);
            let saved = previous.join(&entry);
            if saved.exists() {
                remove_path(&live)
                    .map_err(|err| io_error(format!("remove {}", live.display()), err))?;
                fs::rename(&saved, &live)
                    .map_err(|err| io_error(format!("restore {}", live.display()), err))?;
            } else if !existed.contains(&entry.as_str()) {
                // Moved in from staging; the target never had it.
                remove_path(&live)
                    .map_err(|err| io_error(format!("remove {}", live.display()), err))?;
            }
        }
        fs::remove_file(&marker).map_err(|err| io_error("remove swap marker", err))?;
        info!(
            "event=store_swap_recover module=storage status=ok root={}",
            target.root().display()
        );
    }
    if previous.exists() {
        remove_dir_quiet(&previous);
    }
    Ok(())
}

/// Removes staging directories left behind by a crash.
pub(crate) fn remove_stale_staging(root: &Path) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(STAGING_PREFIX) {
            warn!(
                "event=staging_cleanup module=storage status=ok path={}",
                entry.path().display()
            );
            remove_dir_quiet(&entry.path());
        }
    }
}

fn move_store(from: &Path, to: &Path) -> StorageResult<()> {
    for entry in store_entries() {
        let source = from.join(&entry);
        if !source.exists() {
            continue;
        }
        let target = to.join(&entry);
        fs::rename(&source, &target).map_err(|err| {
            io_error(
                format!("move {} to {}", source.display(), target.display()),
                err,
            )
        })?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub(crate) fn remove_dir_quiet(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(
                "event=dir_cleanup module=storage status=error path={} error={}",
                path.display(),
                err
            );
        }
    }
}

/// Copies one file, returning its byte count.
pub(crate) fn copy_file(from: &Path, to: &Path) -> StorageResult<u64> {
    fs::copy(from, to).map_err(|err| {
        io_error(
            format!("copy {} to {}", from.display(), to.display()),
            err,
        )
    })
}

/// Returns `path` or `path (n)` for the first `n` that does not exist yet.
pub(crate) fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    (2..)
        .map(|n| parent.join(format!("{name} ({n})")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::{recover_interrupted_swap, swap_into_place, StagingDir};
    use crate::storage::layout::{NotebookLayout, SWAP_MARKER_FILE};
    use crate::storage::StorageError;
    use std::fs;

    fn write_store(layout: &NotebookLayout, tag: &str) {
        fs::create_dir_all(layout.media_dir()).unwrap();
        fs::write(layout.record_store(), tag).unwrap();
        fs::write(layout.media_dir().join("m"), tag).unwrap();
    }

    #[test]
    fn swap_replaces_store_and_drops_previous() {
        let dir = tempfile::tempdir().unwrap();
        let live = NotebookLayout::new(dir.path());
        write_store(&live, "old");
        let staging = StagingDir::create(dir.path()).unwrap();
        write_store(staging.layout(), "new");

        swap_into_place(&live, staging.layout(), |_| Ok(())).unwrap();
        drop(staging);

        assert_eq!(fs::read_to_string(live.record_store()).unwrap(), "new");
        assert_eq!(fs::read_to_string(live.media_dir().join("m")).unwrap(), "new");
        assert!(!live.swap_previous_dir().exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 2);
    }

    #[test]
    fn failed_activation_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let live = NotebookLayout::new(dir.path());
        write_store(&live, "old");
        let staging = StagingDir::create(dir.path()).unwrap();
        write_store(staging.layout(), "new");

        let result: Result<(), _> = swap_into_place(&live, staging.layout(), |_| {
            Err(StorageError::Integrity("refused".to_string()))
        });

        assert!(matches!(result, Err(StorageError::Integrity(_))));
        assert_eq!(fs::read_to_string(live.record_store()).unwrap(), "old");
        assert_eq!(fs::read_to_string(live.media_dir().join("m")).unwrap(), "old");
    }

    #[test]
    fn interrupted_swap_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let live = NotebookLayout::new(dir.path());
        write_store(&live, "new-partial");
        let previous = NotebookLayout::new(live.swap_previous_dir());
        write_store(&previous, "old");
        fs::write(live.swap_previous_dir().join(SWAP_MARKER_FILE), b"").unwrap();

        recover_interrupted_swap(&live).unwrap();

        assert_eq!(fs::read_to_string(live.record_store()).unwrap(), "old");
        assert!(!live.swap_previous_dir().exists());
    }
}
