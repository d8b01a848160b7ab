//! Durable storage of one notebook: record store plus media directory.
//!
//! # Responsibility
//! - Own the writer connection and the media store of the active notebook.
//! - Provide the snapshot, restore and relocate primitives used by the
//!   lifecycle coordinator.
//!
//! # Invariants
//! - Every structural mutation is one record-store transaction.
//! - Media files are released only after the transaction that dropped
//!   their last reference committed.
//! - A store directory is never made live before it passed verification.

use crate::db::{open_db, open_reader, DbError};
use crate::model::item::{now_epoch_ms, ItemId, NotebookItem};
use crate::model::media::MediaAsset;
use crate::repo::item_repo::{
    DeletedSubtree, ItemRepository, NewItem, SqliteItemRepository, StoreCounts,
};
use crate::repo::RepoError;
use log::{info, warn};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod layout;
pub mod manifest;
pub mod media;
mod snapshot;
pub(crate) mod swap;

pub use layout::{NotebookLayout, MANIFEST_FILE, MEDIA_DIR, RECORD_STORE_FILE};
pub use manifest::BackupManifest;
pub use media::{IngestedMedia, MediaPin, MediaStore};
pub use snapshot::SnapshotSource;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    Db(DbError),
    Io { context: String, source: io::Error },
    /// A store or backup failed verification.
    Integrity(String),
    /// Destination already holds data and overwrite was not requested.
    Conflict(PathBuf),
    NotFound(ItemId),
    InvalidData(String),
    /// Cancellation was observed before the commit point.
    Cancelled,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Integrity(message) => write!(f, "integrity check failed: {message}"),
            Self::Conflict(path) => {
                write!(f, "destination `{}` already holds data", path.display())
            }
            Self::NotFound(id) => write!(f, "notebook item not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid data: {message}"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<DbError> for StorageError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<RepoError> for StorageError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Db(err) => Self::Db(err),
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::UninitializedConnection { .. } | RepoError::MissingRequiredTable(_) => {
                Self::Integrity(value.to_string())
            }
            RepoError::InvalidData(message) => Self::InvalidData(message),
        }
    }
}

pub(crate) fn io_error(context: impl Into<String>, source: io::Error) -> StorageError {
    StorageError::Io {
        context: context.into(),
        source,
    }
}

/// Writer side of one notebook directory.
pub struct StorageBackend {
    layout: NotebookLayout,
    conn: Connection,
    media: Arc<MediaStore>,
}

impl StorageBackend {
    /// Opens (or creates) the notebook at `root`.
    ///
    /// # Side effects
    /// - Finishes or rolls back a swap interrupted by a crash.
    /// - Removes stale staging directories.
    /// - Creates the root folder row in a fresh store.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let layout = NotebookLayout::new(root);
        fs::create_dir_all(layout.media_dir())
            .map_err(|err| io_error(format!("create {}", layout.media_dir().display()), err))?;
        swap::recover_interrupted_swap(&layout)?;
        swap::remove_stale_staging(layout.root());

        let conn = open_writer(&layout)?;
        let media = Arc::new(MediaStore::new(layout.media_dir()));
        info!(
            "event=storage_open module=storage status=ok root={}",
            layout.root().display()
        );
        Ok(Self {
            layout,
            conn,
            media,
        })
    }

    pub fn layout(&self) -> &NotebookLayout {
        &self.layout
    }

    pub fn media(&self) -> &Arc<MediaStore> {
        &self.media
    }

    fn repo(&self) -> StorageResult<SqliteItemRepository<'_>> {
        Ok(SqliteItemRepository::try_new(&self.conn)?)
    }

    pub fn load_items(&self) -> StorageResult<Vec<NotebookItem>> {
        Ok(self.repo()?.load_items()?)
    }

    pub fn insert_item(&self, item: &NotebookItem) -> StorageResult<()> {
        Ok(self.repo()?.insert_item(item)?)
    }

    pub fn insert_items(&self, items: &[NewItem<'_>]) -> StorageResult<()> {
        Ok(self.repo()?.insert_items(items)?)
    }

    pub fn rename_item(&self, item_uuid: ItemId, display_name: &str) -> StorageResult<()> {
        Ok(self
            .repo()?
            .rename_item(item_uuid, display_name, now_epoch_ms())?)
    }

    pub fn move_subtree(
        &self,
        item_uuid: ItemId,
        new_parent_uuid: ItemId,
        sort_order: i64,
        depth_delta: i32,
    ) -> StorageResult<()> {
        Ok(self.repo()?.move_subtree(
            item_uuid,
            new_parent_uuid,
            sort_order,
            depth_delta,
            now_epoch_ms(),
        )?)
    }

    /// Deletes a subtree and then releases media nothing references anymore.
    pub fn delete_subtree(&self, item_uuid: ItemId) -> StorageResult<DeletedSubtree> {
        let deleted = self.repo()?.delete_subtree(item_uuid)?;
        self.media.release(
            deleted
                .released_media
                .iter()
                .map(|asset| asset.file_name.as_str()),
        );
        Ok(deleted)
    }

    pub fn note_body(&self, note_uuid: ItemId) -> StorageResult<String> {
        Ok(self.repo()?.note_body(note_uuid)?)
    }

    pub fn set_note_body(&self, note_uuid: ItemId, body: &str) -> StorageResult<()> {
        Ok(self.repo()?.set_note_body(note_uuid, body, now_epoch_ms())?)
    }

    /// Copies `source` into the media directory and references it from the
    /// note.
    pub fn attach_media(&self, note_uuid: ItemId, source: &Path) -> StorageResult<MediaAsset> {
        let repo = self.repo()?;
        let ingested = self
            .media
            .ingest(source)
            .map_err(|err| io_error(format!("ingest {}", source.display()), err))?;
        let stored = match repo.attach_media(note_uuid, &ingested.asset, now_epoch_ms()) {
            Ok(stored) => stored,
            Err(err) => {
                if ingested.created {
                    self.media.release([ingested.asset.file_name.as_str()]);
                }
                return Err(err.into());
            }
        };
        // Same bytes under another extension: the first recorded file wins.
        if ingested.created && stored.file_name != ingested.asset.file_name {
            self.media.release([ingested.asset.file_name.as_str()]);
        }
        Ok(stored)
    }

    /// Drops one reference; returns whether the reference existed.
    pub fn detach_media(&self, note_uuid: ItemId, media_id: &str) -> StorageResult<bool> {
        let repo = self.repo()?;
        let attached = repo
            .note_media(note_uuid)?
            .iter()
            .any(|asset| asset.media_id == media_id);
        if !attached {
            return Ok(false);
        }
        if let Some(released) = repo.detach_media(note_uuid, media_id)? {
            self.media.release([released.file_name.as_str()]);
        }
        Ok(true)
    }

    pub fn note_media(&self, note_uuid: ItemId) -> StorageResult<Vec<MediaAsset>> {
        Ok(self.repo()?.note_media(note_uuid)?)
    }

    pub fn media_assets(&self) -> StorageResult<Vec<MediaAsset>> {
        Ok(self.repo()?.media_assets()?)
    }

    pub fn counts(&self) -> StorageResult<StoreCounts> {
        Ok(self.repo()?.counts()?)
    }

    /// Releases media files no asset row accounts for.
    pub fn collect_media_garbage(&self) -> StorageResult<Vec<String>> {
        let known: BTreeSet<String> = self
            .media_assets()?
            .into_iter()
            .map(|asset| asset.file_name)
            .collect();
        let orphans: Vec<String> = self
            .media
            .list_files()
            .map_err(|err| io_error(format!("list {}", self.media.dir().display()), err))?
            .into_iter()
            .filter(|name| !known.contains(name))
            .collect();
        self.media.release(orphans.iter().map(String::as_str));
        if !orphans.is_empty() {
            warn!(
                "event=media_gc module=storage status=ok released={}",
                orphans.len()
            );
        }
        Ok(orphans)
    }

    /// Opens a read-only connection on the live record store.
    pub fn open_reader(&self) -> StorageResult<Connection> {
        Ok(open_reader(self.layout.record_store())?)
    }

    /// Replaces the writer connection, closing the previous one.
    fn replace_connection(&mut self, conn: Connection) -> StorageResult<()> {
        let previous = std::mem::replace(&mut self.conn, conn);
        previous
            .close()
            .map_err(|(_, err)| StorageError::Db(DbError::Sqlite(err)))
    }

    /// Closes the writer connection so store files can be renamed.
    fn close_connection(&mut self) -> StorageResult<()> {
        let placeholder = Connection::open_in_memory()?;
        self.replace_connection(placeholder)
    }
}

/// Opens the writer connection and makes sure the root folder exists.
fn open_writer(layout: &NotebookLayout) -> StorageResult<Connection> {
    let conn = open_db(layout.record_store())?;
    SqliteItemRepository::try_new(&conn)?.ensure_root(now_epoch_ms())?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::StorageBackend;
    use crate::model::item::{ItemKind, NotebookItem};
    use std::fs;

    #[test]
    fn open_creates_layout_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("book");
        let storage = StorageBackend::open(&root).unwrap();
        assert!(root.join("notes.db").is_file());
        assert!(root.join("notes_media").is_dir());
        let items = storage.load_items().unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_root());
    }

    #[test]
    fn media_garbage_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageBackend::open(dir.path()).unwrap();
        let root = storage.load_items().unwrap().remove(0);
        let note = NotebookItem::new_child(&root, ItemKind::Note, "N", 0, 0, 0);
        storage.insert_item(&note).unwrap();
        let source = dir.path().join("pic.png");
        fs::write(&source, b"png").unwrap();
        let asset = storage.attach_media(note.item_uuid, &source).unwrap();
        fs::write(storage.media().path_of("stray.bin"), b"?").unwrap();

        let released = storage.collect_media_garbage().unwrap();

        assert_eq!(released, vec!["stray.bin".to_string()]);
        assert!(storage.media().path_of(&asset.file_name).is_file());
    }

    #[test]
    fn detach_reports_unknown_reference() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageBackend::open(dir.path()).unwrap();
        let root = storage.load_items().unwrap().remove(0);
        let note = NotebookItem::new_child(&root, ItemKind::Note, "N", 0, 0, 0);
        storage.insert_item(&note).unwrap();
        assert!(!storage.detach_media(note.item_uuid, &"0".repeat(64)).unwrap());
    }
}
