//! Snapshot, restore and relocate primitives.
//!
//! # Responsibility
//! - Write a verified, self-contained copy of the store (backup).
//! - Replace the live store with a verified copy of a backup (restore).
//! - Move the live store to another directory (relocate).
//!
//! # Invariants
//! - All copies land in a staging directory first and are verified there.
//! - Cancellation is honored only before the commit step; a cancelled or
//!   failed run leaves the live store and the destination untouched.

use super::layout::NotebookLayout;
use super::manifest::{verify_store, BackupManifest};
use super::media::{MediaPin, MediaStore};
use super::swap::{copy_file, swap_into_place, StagingDir};
use super::{io_error, open_writer, StorageBackend, StorageError, StorageResult};
use crate::db::{open_db, open_reader, open_snapshot_source, seal_copy, vacuum_into, DbError};
use crate::model::media::MediaAsset;
use crate::progress::{OperationPhase, ProgressSink};
use crate::repo::item_repo::{ItemRepository, SqliteItemRepository};
use crate::storage::layout::MANIFEST_FILE;
use crate::tree::snapshot::TreeSnapshot;
use log::info;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Consistent read handle on the live store used by a running backup.
///
/// Holds its own connection and pins the media directory, so the notebook
/// write lock is not needed while copying.
pub struct SnapshotSource {
    conn: Connection,
    media: Arc<MediaStore>,
    _pin: MediaPin,
}

impl StorageBackend {
    /// Pins media and opens a snapshot connection. Call with the write lock
    /// held; the returned source is used after the lock is released.
    pub fn snapshot_source(&self) -> StorageResult<SnapshotSource> {
        let pin = self.media.pin();
        let conn = open_snapshot_source(self.layout.record_store())?;
        Ok(SnapshotSource {
            conn,
            media: Arc::clone(&self.media),
            _pin: pin,
        })
    }

    /// Writes a verified backup of the live store to `destination`.
    pub fn snapshot(
        &self,
        destination: &Path,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<BackupManifest> {
        self.snapshot_source()?.write_to(destination, sink)
    }

    /// Replaces the live store with the backup at `source`.
    ///
    /// `source` is a backup directory or its `manifest.json`. Returns the
    /// backup manifest and the verified item tree now live.
    pub fn restore_from(
        &mut self,
        source: &Path,
        max_depth: u32,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<(BackupManifest, TreeSnapshot)> {
        let source_dir = resolve_backup_dir(source);
        let manifest = BackupManifest::validate_source(&source_dir)?;
        let source_layout = NotebookLayout::new(&source_dir);
        check_cancelled(sink)?;

        sink.enter_phase(OperationPhase::Transferring);
        let staging = StagingDir::create(self.layout.root())?;
        let db_bytes = file_len(&source_layout.record_store())?;
        sink.set_totals(
            1 + manifest.media.len() as u64,
            db_bytes + manifest.media_bytes(),
        );
        copy_file(
            &source_layout.record_store(),
            &staging.layout().record_store(),
        )?;
        sink.advance(1, db_bytes);
        copy_media(
            &manifest.media,
            &source_layout.media_dir(),
            &staging.layout().media_dir(),
            sink,
        )?;

        sink.enter_phase(OperationPhase::Verifying);
        check_cancelled(sink)?;
        // Bring older schema versions up to date inside staging only.
        open_db(staging.layout().record_store())?
            .close()
            .map_err(|(_, err)| StorageError::Db(DbError::Sqlite(err)))?;
        seal_copy(staging.layout().record_store())?;
        let tree = verify_store(staging.layout(), &manifest)?;
        if i64::from(tree.deepest_depth()) > i64::from(max_depth) {
            return Err(StorageError::Integrity(format!(
                "backup nests items {} levels deep, limit is {max_depth}",
                tree.deepest_depth()
            )));
        }

        check_cancelled(sink)?;
        sink.enter_phase(OperationPhase::Committing);
        self.close_connection()?;
        match swap_into_place(&self.layout, staging.layout(), open_writer) {
            Ok(conn) => self.replace_connection(conn)?,
            Err(err) => {
                let conn = open_writer(&self.layout)?;
                self.replace_connection(conn)?;
                return Err(err);
            }
        }
        info!(
            "event=store_restore module=storage status=ok root={} notes={} folders={} media={}",
            self.layout.root().display(),
            manifest.note_count,
            manifest.folder_count,
            manifest.media_count
        );
        Ok((manifest, tree))
    }

    /// Copies the live store to `new_root` and makes it the active store.
    ///
    /// The old directory keeps its files; nothing is deleted there.
    pub fn relocate(
        &mut self,
        new_root: &Path,
        overwrite: bool,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<()> {
        fs::create_dir_all(new_root)
            .map_err(|err| io_error(format!("create {}", new_root.display()), err))?;
        let current = canonical(self.layout.root())?;
        let target = canonical(new_root)?;
        if target == current {
            return Err(StorageError::InvalidData(
                "notebook is already stored at this location".to_string(),
            ));
        }
        if target.starts_with(&current) {
            return Err(StorageError::InvalidData(
                "new location is inside the current notebook".to_string(),
            ));
        }
        let new_layout = NotebookLayout::new(new_root);
        if new_layout.has_record_store() && !overwrite {
            return Err(StorageError::Conflict(new_root.to_path_buf()));
        }
        check_cancelled(sink)?;

        sink.enter_phase(OperationPhase::Transferring);
        let staging = StagingDir::create(new_root)?;
        let (counts, media) = {
            let repo = SqliteItemRepository::try_new(&self.conn)?;
            (repo.counts()?, repo.media_assets()?)
        };
        let db_bytes = file_len(&self.layout.record_store())?;
        sink.set_totals(
            1 + media.len() as u64,
            db_bytes + media.iter().map(|asset| asset.byte_len).sum::<u64>(),
        );
        vacuum_into(&self.conn, staging.layout().record_store())?;
        seal_copy(staging.layout().record_store())?;
        sink.advance(1, db_bytes);
        copy_media(
            &media,
            self.media.dir(),
            &staging.layout().media_dir(),
            sink,
        )?;

        sink.enter_phase(OperationPhase::Verifying);
        check_cancelled(sink)?;
        let expected = BackupManifest::new(counts, media);
        verify_store(staging.layout(), &expected)?;

        check_cancelled(sink)?;
        sink.enter_phase(OperationPhase::Committing);
        let conn = swap_into_place(&new_layout, staging.layout(), open_writer)?;
        self.replace_connection(conn)?;
        let previous = std::mem::replace(&mut self.layout, new_layout);
        self.media = Arc::new(MediaStore::new(self.layout.media_dir()));
        info!(
            "event=store_relocate module=storage status=ok from={} to={}",
            previous.root().display(),
            self.layout.root().display()
        );
        Ok(())
    }
}

impl SnapshotSource {
    /// Writes a verified backup to `destination`, which must not exist yet.
    pub fn write_to(
        self,
        destination: &Path,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<BackupManifest> {
        if destination.exists() {
            return Err(StorageError::Conflict(destination.to_path_buf()));
        }
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|err| io_error(format!("create {}", parent.display()), err))?;
        check_cancelled(sink)?;

        sink.enter_phase(OperationPhase::Transferring);
        let staging = StagingDir::create(parent)?;
        let staged_db = staging.layout().record_store();
        vacuum_into(&self.conn, &staged_db)?;
        seal_copy(&staged_db)?;
        let db_bytes = file_len(&staged_db)?;

        // Media list and counts come from the copy so they match it exactly.
        let (counts, media) = {
            let copy = open_reader(&staged_db)?;
            let repo = SqliteItemRepository::try_new(&copy)?;
            (repo.counts()?, repo.media_assets()?)
        };
        sink.set_totals(
            1 + media.len() as u64,
            db_bytes + media.iter().map(|asset| asset.byte_len).sum::<u64>(),
        );
        sink.advance(1, db_bytes);
        copy_media(
            &media,
            self.media.dir(),
            &staging.layout().media_dir(),
            sink,
        )?;
        let manifest = BackupManifest::new(counts, media);
        manifest.save(staging.layout().root())?;

        sink.enter_phase(OperationPhase::Verifying);
        check_cancelled(sink)?;
        BackupManifest::validate_source(staging.layout().root())?;
        verify_store(staging.layout(), &manifest)?;

        check_cancelled(sink)?;
        sink.enter_phase(OperationPhase::Committing);
        fs::rename(staging.layout().root(), destination).map_err(|err| {
            io_error(format!("publish backup {}", destination.display()), err)
        })?;
        info!(
            "event=store_snapshot module=storage status=ok path={} notes={} folders={} media={}",
            destination.display(),
            manifest.note_count,
            manifest.folder_count,
            manifest.media_count
        );
        Ok(manifest)
    }
}

fn copy_media(
    assets: &[MediaAsset],
    from_dir: &Path,
    to_dir: &Path,
    sink: &mut dyn ProgressSink,
) -> StorageResult<()> {
    for asset in assets {
        check_cancelled(sink)?;
        let copied = copy_file(&from_dir.join(&asset.file_name), &to_dir.join(&asset.file_name))?;
        if copied != asset.byte_len {
            return Err(StorageError::Integrity(format!(
                "media `{}` has {copied} bytes, expected {}",
                asset.file_name, asset.byte_len
            )));
        }
        sink.advance(1, copied);
    }
    Ok(())
}

fn check_cancelled(sink: &dyn ProgressSink) -> StorageResult<()> {
    if sink.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

fn resolve_backup_dir(source: &Path) -> PathBuf {
    if source.file_name().is_some_and(|name| name == MANIFEST_FILE) && source.is_file() {
        if let Some(parent) = source.parent() {
            return parent.to_path_buf();
        }
    }
    source.to_path_buf()
}

fn file_len(path: &Path) -> StorageResult<u64> {
    fs::metadata(path)
        .map(|metadata| metadata.len())
        .map_err(|err| io_error(format!("stat {}", path.display()), err))
}

fn canonical(path: &Path) -> StorageResult<PathBuf> {
    fs::canonicalize(path).map_err(|err| io_error(format!("resolve {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use crate::model::item::{ItemKind, NotebookItem};
    use crate::progress::{NoopSink, OperationPhase, ProgressSink};
    use crate::storage::{StorageBackend, StorageError};
    use std::fs;
    use std::path::Path;

    /// Requests cancellation once the run reaches `phase`, after the copy
    /// was staged.
    struct CancelAt {
        phase: OperationPhase,
        cancelled: bool,
    }

    impl CancelAt {
        fn verifying() -> Self {
            Self {
                phase: OperationPhase::Verifying,
                cancelled: false,
            }
        }
    }

    impl ProgressSink for CancelAt {
        fn enter_phase(&mut self, phase: OperationPhase) {
            if phase == self.phase {
                self.cancelled = true;
            }
        }

        fn set_totals(&mut self, _units: u64, _bytes: u64) {}

        fn advance(&mut self, _units: u64, _bytes: u64) {}

        fn is_cancelled(&self) -> bool {
            self.cancelled
        }
    }

    fn hidden_entries(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count()
    }
    fn seeded(root: &std::path::Path) -> StorageBackend {
        let storage = StorageBackend::open(root).unwrap();
        let top = storage.load_items().unwrap().remove(0);
        let folder = NotebookItem::new_child(&top, ItemKind::Folder, "Work", 0, 0, 0);
        let note = NotebookItem::new_child(&folder, ItemKind::Note, "Plan", 1, 0, 0);
        storage.insert_item(&folder).unwrap();
        storage.insert_item(&note).unwrap();
        storage.set_note_body(note.item_uuid, "ship it").unwrap();
        storage
    }

    #[test]
    fn snapshot_then_restore_brings_back_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = seeded(&dir.path().join("book"));
        let backup = dir.path().join("backups").join("first");
        let manifest = storage.snapshot(&backup, &mut NoopSink).unwrap();
        assert_eq!((manifest.folder_count, manifest.note_count), (1, 1));

        let extra_parent = storage.load_items().unwrap().remove(0);
        let extra = NotebookItem::new_child(&extra_parent, ItemKind::Note, "Later", 0, 9, 0);
        storage.insert_item(&extra).unwrap();

        let (_, tree) = storage.restore_from(&backup, 10, &mut NoopSink).unwrap();
        assert_eq!(tree.note_count(), 1);
        assert_eq!(storage.counts().unwrap().notes, 1);
    }

    #[test]
    fn snapshot_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let storage = seeded(&dir.path().join("book"));
        let backup = dir.path().join("taken");
        fs::create_dir_all(&backup).unwrap();
        assert!(matches!(
            storage.snapshot(&backup, &mut NoopSink),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn snapshot_cancelled_after_staging_removes_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = seeded(&dir.path().join("book"));
        let backups = dir.path().join("backups");
        let backup = backups.join("first");

        let result = storage.snapshot(&backup, &mut CancelAt::verifying());

        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert!(!backup.exists());
        assert_eq!(hidden_entries(&backups), 0);
    }

    #[test]
    fn relocate_cancelled_after_staging_keeps_current_root() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("book");
        let new_root = dir.path().join("moved");
        let mut storage = seeded(&old_root);

        let result = storage.relocate(&new_root, false, &mut CancelAt::verifying());

        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(storage.layout().root(), old_root.as_path());
        assert!(!new_root.join("notes.db").exists());
        assert_eq!(hidden_entries(&new_root), 0);
        assert_eq!(storage.counts().unwrap().notes, 1);
    }

    #[test]
    fn restore_cancelled_after_staging_keeps_live_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("book");
        let mut storage = seeded(&root);
        let backup = dir.path().join("backups").join("first");
        storage.snapshot(&backup, &mut NoopSink).unwrap();
        let parent = storage.load_items().unwrap().remove(0);
        let extra = NotebookItem::new_child(&parent, ItemKind::Note, "Later", 0, 9, 0);
        storage.insert_item(&extra).unwrap();

        let result = storage.restore_from(&backup, 10, &mut CancelAt::verifying());

        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(storage.counts().unwrap().notes, 2);
        assert_eq!(hidden_entries(&root), 0);
        drop(storage);
        assert_eq!(StorageBackend::open(&root).unwrap().counts().unwrap().notes, 2);
    }

    #[test]
    fn relocate_switches_active_root_and_keeps_old_copy() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("book");
        let new_root = dir.path().join("moved");
        let mut storage = seeded(&old_root);

        storage.relocate(&new_root, false, &mut NoopSink).unwrap();

        assert_eq!(storage.layout().root(), new_root.as_path());
        assert_eq!(storage.counts().unwrap().notes, 1);
        assert!(old_root.join("notes.db").is_file());
        assert!(new_root.join("notes.db").is_file());
    }
}
