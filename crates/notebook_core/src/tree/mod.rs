//! Notebook hierarchy: the only structural mutation surface.
//!
//! # Responsibility
//! - Validate every mutation through `PathPolicy`.
//! - Commit through `StorageBackend` and publish the new tree snapshot.
//!
//! # Invariants
//! - Mutations are serialized by one write mutex per notebook.
//! - A snapshot is published only after its transaction committed; readers
//!   never observe a mutation mid-flight.
//! - At most one lifecycle operation is registered per notebook.

use crate::config::NotebookConfig;
use crate::model::item::{now_epoch_ms, ItemId, ItemKind, NotebookItem};
use crate::model::media::MediaAsset;
use crate::policy::{PathPolicy, PolicyError};
use crate::progress::{OperationId, OperationKind};
use crate::repo::item_repo::NewItem;
use crate::storage::{StorageBackend, StorageError};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

pub mod snapshot;

use snapshot::TreeSnapshot;

pub type TreeResult<T> = Result<T, TreeError>;

#[derive(Debug)]
pub enum TreeError {
    Validation(PolicyError),
    NotFound(ItemId),
    /// Parent exists but is a note.
    ParentNotFolder(ItemId),
    /// Item exists but is not a note.
    NotANote(ItemId),
    /// The root folder cannot be renamed, moved or deleted.
    RootImmutable,
    /// Moving an item under itself or one of its descendants.
    CycleDetected { item_uuid: ItemId, parent_uuid: ItemId },
    MediaNotAttached { note_uuid: ItemId, media_id: String },
    Storage(StorageError),
}

impl Display for TreeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "notebook item not found: {id}"),
            Self::ParentNotFolder(id) => write!(f, "item {id} is not a folder"),
            Self::NotANote(id) => write!(f, "item {id} is not a note"),
            Self::RootImmutable => write!(f, "the root folder cannot be changed"),
            Self::CycleDetected {
                item_uuid,
                parent_uuid,
            } => write!(f, "cannot move {item_uuid} under its own descendant {parent_uuid}"),
            Self::MediaNotAttached {
                note_uuid,
                media_id,
            } => write!(f, "media {media_id} is not attached to note {note_uuid}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TreeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PolicyError> for TreeError {
    fn from(value: PolicyError) -> Self {
        Self::Validation(value)
    }
}

impl From<StorageError> for TreeError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

/// Result of a subtree delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Removed item ids, subtree root first.
    pub removed: Vec<ItemId>,
    pub released_media: Vec<MediaAsset>,
}

/// One parsed note ready to be merged into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedNote {
    /// Folder names below the root.
    pub folder_path: Vec<String>,
    pub title: String,
    pub body: String,
}

/// Counts of one committed import batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportApplied {
    pub created_folders: usize,
    pub created_notes: usize,
    /// Notes refused by the naming policy at commit time, including notes
    /// whose folder could not be created.
    pub rejected_notes: usize,
}

/// Lifecycle operation currently registered on a notebook.
#[derive(Debug, Clone)]
pub(crate) struct ActiveOperation {
    pub(crate) id: OperationId,
    pub(crate) kind: OperationKind,
    pub(crate) token: CancellationToken,
}

/// Releases the lifecycle slot on drop.
#[derive(Debug)]
pub(crate) struct OperationSlot {
    tree: Arc<NotebookTree>,
    id: OperationId,
}

impl Drop for OperationSlot {
    fn drop(&mut self) {
        let mut active = lock_or_recover(&self.tree.active);
        if active.as_ref().is_some_and(|op| op.id == self.id) {
            *active = None;
        }
    }
}

/// In-memory index plus write side of one notebook.
pub struct NotebookTree {
    policy: PathPolicy,
    storage: Mutex<StorageBackend>,
    snapshot: RwLock<Arc<TreeSnapshot>>,
    active: Mutex<Option<ActiveOperation>>,
}

impl std::fmt::Debug for NotebookTree {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookTree")
            .field("policy", &self.policy)
            .field("items", &self.snapshot().len())
            .finish()
    }
}

impl NotebookTree {
    /// Opens the notebook at `root`, creating it when missing.
    pub fn open(root: impl Into<PathBuf>, config: &NotebookConfig) -> TreeResult<Self> {
        let storage = StorageBackend::open(root)?;
        Self::from_storage(storage, PathPolicy::from_config(config))
    }

    pub fn from_storage(storage: StorageBackend, policy: PathPolicy) -> TreeResult<Self> {
        let items = storage.load_items()?;
        let snapshot = TreeSnapshot::from_items(items).map_err(|message| {
            TreeError::Storage(StorageError::Integrity(format!(
                "stored item tree is invalid: {message}"
            )))
        })?;
        if i64::from(snapshot.deepest_depth()) > i64::from(policy.max_depth()) {
            warn!(
                "event=tree_open module=tree status=warn reason=deeper_than_limit depth={} limit={}",
                snapshot.deepest_depth(),
                policy.max_depth()
            );
        }
        info!(
            "event=tree_open module=tree status=ok items={}",
            snapshot.len()
        );
        Ok(Self {
            policy,
            storage: Mutex::new(storage),
            snapshot: RwLock::new(Arc::new(snapshot)),
            active: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> PathPolicy {
        self.policy
    }

    /// Directory of the active store. Waits while a restore or relocate
    /// holds the write lock.
    pub fn location(&self) -> PathBuf {
        self.lock_storage().layout().root().to_path_buf()
    }

    /// Last committed state of the hierarchy.
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => (*guard).clone(),
            Err(poisoned) => (*poisoned.into_inner()).clone(),
        }
    }

    pub fn root_id(&self) -> ItemId {
        self.snapshot().root_uuid()
    }

    pub fn get(&self, item_uuid: ItemId) -> Option<NotebookItem> {
        self.snapshot().get(item_uuid).cloned()
    }

    pub fn children(&self, item_uuid: ItemId) -> TreeResult<Vec<NotebookItem>> {
        let snapshot = self.snapshot();
        if !snapshot.contains(item_uuid) {
            return Err(TreeError::NotFound(item_uuid));
        }
        Ok(snapshot.children(item_uuid).cloned().collect())
    }

    pub fn create_folder(&self, parent_uuid: ItemId, name: &str) -> TreeResult<NotebookItem> {
        self.create_item(parent_uuid, name, ItemKind::Folder)
    }

    pub fn create_note(&self, parent_uuid: ItemId, name: &str) -> TreeResult<NotebookItem> {
        self.create_item(parent_uuid, name, ItemKind::Note)
    }

    fn create_item(
        &self,
        parent_uuid: ItemId,
        name: &str,
        kind: ItemKind,
    ) -> TreeResult<NotebookItem> {
        let name = self.policy.validate_name(name)?;
        let storage = self.lock_storage();
        let current = self.snapshot();
        let parent = current
            .get(parent_uuid)
            .ok_or(TreeError::NotFound(parent_uuid))?;
        if !parent.is_folder() {
            return Err(TreeError::ParentNotFolder(parent_uuid));
        }
        let depth = self.policy.compute_depth(parent.depth)?;
        self.policy.ensure_unique(
            &name,
            current
                .children(parent_uuid)
                .map(|sibling| sibling.display_name.as_str()),
        )?;

        let item = NotebookItem::new_child(
            parent,
            kind,
            name,
            depth,
            current.next_sort_order(parent_uuid),
            now_epoch_ms(),
        );
        storage.insert_item(&item)?;

        let mut next = TreeSnapshot::clone(&current);
        next.insert(item.clone());
        self.publish(next);
        info!(
            "event=item_create module=tree status=ok kind={} depth={}",
            kind.as_str(),
            depth
        );
        Ok(item)
    }

    pub fn rename(&self, item_uuid: ItemId, name: &str) -> TreeResult<NotebookItem> {
        let name = self.policy.validate_name(name)?;
        let storage = self.lock_storage();
        let current = self.snapshot();
        let item = current
            .get(item_uuid)
            .ok_or(TreeError::NotFound(item_uuid))?;
        if item.is_root() {
            return Err(TreeError::RootImmutable);
        }
        if let Some(parent_uuid) = item.parent_uuid {
            self.policy.ensure_unique(
                &name,
                current
                    .children(parent_uuid)
                    .filter(|sibling| sibling.item_uuid != item_uuid)
                    .map(|sibling| sibling.display_name.as_str()),
            )?;
        }

        storage.rename_item(item_uuid, &name)?;
        let mut next = TreeSnapshot::clone(&current);
        next.rename(item_uuid, &name, now_epoch_ms());
        let renamed = next.get(item_uuid).cloned();
        self.publish(next);
        info!("event=item_rename module=tree status=ok");
        renamed.ok_or(TreeError::NotFound(item_uuid))
    }

    /// Removes an item with its whole subtree.
    pub fn delete(&self, item_uuid: ItemId) -> TreeResult<DeleteOutcome> {
        let storage = self.lock_storage();
        let current = self.snapshot();
        let item = current
            .get(item_uuid)
            .ok_or(TreeError::NotFound(item_uuid))?;
        if item.is_root() {
            return Err(TreeError::RootImmutable);
        }

        let deleted = storage.delete_subtree(item_uuid)?;
        let mut next = TreeSnapshot::clone(&current);
        let removed = next.remove_subtree(item_uuid);
        if removed.len() != deleted.item_ids.len() {
            warn!(
                "event=item_delete module=tree status=warn reason=index_mismatch index={} store={}",
                removed.len(),
                deleted.item_ids.len()
            );
        }
        self.publish(next);
        info!(
            "event=item_delete module=tree status=ok removed={} released_media={}",
            removed.len(),
            deleted.released_media.len()
        );
        Ok(DeleteOutcome {
            removed,
            released_media: deleted.released_media,
        })
    }

    /// Reparents an item; every descendant's depth shifts with it.
    pub fn move_item(&self, item_uuid: ItemId, new_parent_uuid: ItemId) -> TreeResult<NotebookItem> {
        let storage = self.lock_storage();
        let current = self.snapshot();
        let item = current
            .get(item_uuid)
            .ok_or(TreeError::NotFound(item_uuid))?;
        if item.is_root() {
            return Err(TreeError::RootImmutable);
        }
        let parent = current
            .get(new_parent_uuid)
            .ok_or(TreeError::NotFound(new_parent_uuid))?;
        if !parent.is_folder() {
            return Err(TreeError::ParentNotFolder(new_parent_uuid));
        }
        if current.is_ancestor_or_self(item_uuid, new_parent_uuid) {
            return Err(TreeError::CycleDetected {
                item_uuid,
                parent_uuid: new_parent_uuid,
            });
        }
        if item.parent_uuid == Some(new_parent_uuid) {
            return Ok(item.clone());
        }

        let new_depth = self.policy.compute_depth(parent.depth)?;
        self.policy
            .check_subtree_fits(new_depth, current.subtree_height(item_uuid))?;
        self.policy.ensure_unique(
            &item.display_name,
            current
                .children(new_parent_uuid)
                .map(|sibling| sibling.display_name.as_str()),
        )?;

        let depth_delta = new_depth - item.depth;
        let sort_order = current.next_sort_order(new_parent_uuid);
        storage.move_subtree(item_uuid, new_parent_uuid, sort_order, depth_delta)?;

        let mut next = TreeSnapshot::clone(&current);
        next.reparent(
            item_uuid,
            new_parent_uuid,
            sort_order,
            depth_delta,
            now_epoch_ms(),
        );
        let moved = next.get(item_uuid).cloned();
        self.publish(next);
        info!(
            "event=item_move module=tree status=ok depth_delta={}",
            depth_delta
        );
        moved.ok_or(TreeError::NotFound(item_uuid))
    }

    pub fn note_body(&self, note_uuid: ItemId) -> TreeResult<String> {
        self.ensure_note(&self.snapshot(), note_uuid)?;
        Ok(self.lock_storage().note_body(note_uuid)?)
    }

    pub fn set_note_body(&self, note_uuid: ItemId, body: &str) -> TreeResult<()> {
        let storage = self.lock_storage();
        let current = self.snapshot();
        self.ensure_note(&current, note_uuid)?;
        storage.set_note_body(note_uuid, body)?;
        let mut next = TreeSnapshot::clone(&current);
        next.touch(note_uuid, now_epoch_ms());
        self.publish(next);
        Ok(())
    }

    /// Copies a file into the media directory and references it from a note.
    pub fn attach_media(&self, note_uuid: ItemId, source: &Path) -> TreeResult<MediaAsset> {
        let storage = self.lock_storage();
        let current = self.snapshot();
        self.ensure_note(&current, note_uuid)?;
        let asset = storage.attach_media(note_uuid, source)?;
        let mut next = TreeSnapshot::clone(&current);
        next.touch(note_uuid, now_epoch_ms());
        self.publish(next);
        Ok(asset)
    }

    pub fn detach_media(&self, note_uuid: ItemId, media_id: &str) -> TreeResult<()> {
        let storage = self.lock_storage();
        self.ensure_note(&self.snapshot(), note_uuid)?;
        if !storage.detach_media(note_uuid, media_id)? {
            return Err(TreeError::MediaNotAttached {
                note_uuid,
                media_id: media_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn note_media(&self, note_uuid: ItemId) -> TreeResult<Vec<MediaAsset>> {
        self.ensure_note(&self.snapshot(), note_uuid)?;
        Ok(self.lock_storage().note_media(note_uuid)?)
    }

    /// Deletes files in the media directory that no asset row accounts for.
    pub fn collect_media_garbage(&self) -> TreeResult<Vec<String>> {
        Ok(self.lock_storage().collect_media_garbage()?)
    }

    fn ensure_note(&self, snapshot: &TreeSnapshot, note_uuid: ItemId) -> TreeResult<()> {
        match snapshot.get(note_uuid) {
            Some(item) if item.is_note() => Ok(()),
            Some(_) => Err(TreeError::NotANote(note_uuid)),
            None => Err(TreeError::NotFound(note_uuid)),
        }
    }

    /// Merges parsed notes (and empty folders) into the tree in one
    /// transaction. Folders with the same name under the same parent are
    /// reused. A note whose title or folder path breaks the naming policy
    /// is counted in `rejected_notes`; the rest of the batch still commits.
    pub(crate) fn apply_import(
        &self,
        folders: &[Vec<String>],
        notes: &[ImportedNote],
    ) -> TreeResult<ImportApplied> {
        let storage = self.lock_storage();
        let current = self.snapshot();
        let mut next = TreeSnapshot::clone(&current);
        let mut created: Vec<(NotebookItem, Option<String>)> = Vec::new();
        let mut applied = ImportApplied::default();
        let now_ms = now_epoch_ms();

        for path in folders {
            match self.resolve_folder(&mut next, path, now_ms, &mut created, &mut applied) {
                Ok(_) => {}
                Err(TreeError::Validation(err)) => warn!(
                    "event=import_apply module=tree status=warn reason=folder_rejected error={}",
                    err
                ),
                Err(err) => return Err(err),
            }
        }
        for note in notes {
            let parent_uuid = match self.resolve_folder(
                &mut next,
                &note.folder_path,
                now_ms,
                &mut created,
                &mut applied,
            ) {
                Ok(uuid) => uuid,
                Err(TreeError::Validation(err)) => {
                    warn!(
                        "event=import_apply module=tree status=warn reason=note_folder_rejected error={}",
                        err
                    );
                    applied.rejected_notes += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let Some(parent) = next.get(parent_uuid).cloned() else {
                return Err(TreeError::NotFound(parent_uuid));
            };
            let placed = self.policy.validate_name(&note.title).and_then(|name| {
                let depth = self.policy.compute_depth(parent.depth)?;
                self.policy.ensure_unique(
                    &name,
                    next.children(parent_uuid)
                        .map(|sibling| sibling.display_name.as_str()),
                )?;
                Ok((name, depth))
            });
            let (name, depth) = match placed {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "event=import_apply module=tree status=warn reason=note_rejected error={}",
                        err
                    );
                    applied.rejected_notes += 1;
                    continue;
                }
            };
            let item = NotebookItem::new_child(
                &parent,
                ItemKind::Note,
                name,
                depth,
                next.next_sort_order(parent_uuid),
                now_ms,
            );
            next.insert(item.clone());
            created.push((item, Some(note.body.clone())));
            applied.created_notes += 1;
        }

        let batch: Vec<NewItem<'_>> = created
            .iter()
            .map(|(item, body)| NewItem {
                item,
                body: body.as_deref(),
            })
            .collect();
        storage.insert_items(&batch)?;
        self.publish(next);
        info!(
            "event=import_apply module=tree status=ok folders={} notes={} rejected={}",
            applied.created_folders, applied.created_notes, applied.rejected_notes
        );
        Ok(applied)
    }

    fn resolve_folder(
        &self,
        next: &mut TreeSnapshot,
        path: &[String],
        now_ms: i64,
        created: &mut Vec<(NotebookItem, Option<String>)>,
        applied: &mut ImportApplied,
    ) -> TreeResult<ItemId> {
        let mut parent_uuid = next.root_uuid();
        for segment in path {
            let name = self.policy.validate_name(segment)?;
            let existing = next
                .children(parent_uuid)
                .find(|child| child.is_folder() && child.display_name == name)
                .map(|child| child.item_uuid);
            if let Some(existing) = existing {
                parent_uuid = existing;
                continue;
            }
            let Some(parent) = next.get(parent_uuid).cloned() else {
                return Err(TreeError::NotFound(parent_uuid));
            };
            let depth = self.policy.compute_depth(parent.depth)?;
            self.policy.ensure_unique(
                &name,
                next.children(parent_uuid)
                    .map(|sibling| sibling.display_name.as_str()),
            )?;
            let folder = NotebookItem::new_child(
                &parent,
                ItemKind::Folder,
                name,
                depth,
                next.next_sort_order(parent_uuid),
                now_ms,
            );
            parent_uuid = folder.item_uuid;
            next.insert(folder.clone());
            created.push((folder, None));
            applied.created_folders += 1;
        }
        Ok(parent_uuid)
    }

    pub(crate) fn lock_storage(&self) -> MutexGuard<'_, StorageBackend> {
        lock_or_recover(&self.storage)
    }

    /// Replaces the published snapshot. Call with the storage lock held.
    pub(crate) fn publish(&self, snapshot: TreeSnapshot) {
        let next = Arc::new(snapshot);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Registers a lifecycle operation unless one is already running.
    pub(crate) fn begin_operation(
        self: &Arc<Self>,
        operation: ActiveOperation,
    ) -> Result<OperationSlot, ActiveOperation> {
        let mut active = lock_or_recover(&self.active);
        if let Some(running) = active.as_ref() {
            return Err(running.clone());
        }
        let id = operation.id;
        *active = Some(operation);
        Ok(OperationSlot {
            tree: Arc::clone(self),
            id,
        })
    }

    /// Cancels the running operation with `id`. Returns `false` when no
    /// such operation is running.
    pub(crate) fn cancel_operation(&self, id: OperationId) -> bool {
        let active = lock_or_recover(&self.active);
        match active.as_ref() {
            Some(running) if running.id == id => {
                running.token.cancel();
                info!(
                    "event=operation_cancel module=tree status=ok kind={}",
                    running.kind.as_str()
                );
                true
            }
            _ => false,
        }
    }
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Open transactions roll back on drop and snapshots are published only
/// after commit, so the protected state is consistent after a panic.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("event=lock_recover module=tree status=warn");
            poisoned.into_inner()
        }
    }
}
