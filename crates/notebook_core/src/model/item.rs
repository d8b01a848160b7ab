//! Folder/note item model.
//!
//! # Invariants
//! - `item_uuid` is stable and never reused for another item.
//! - `parent_uuid == None` if and only if `depth == ROOT_DEPTH`.
//! - Non-root items satisfy `depth == parent.depth + 1`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a folder or note.
pub type ItemId = Uuid;

/// Depth of the single root folder. Its direct children sit at depth `0`.
pub const ROOT_DEPTH: i32 = -1;

/// Display name given to the root folder of a fresh notebook.
pub const ROOT_DISPLAY_NAME: &str = "Notebook";

/// Kind of a notebook item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Grouping node that can contain child items.
    Folder,
    /// Leaf node owning a text body and media references.
    Note,
}

impl ItemKind {
    /// Storage representation used in `items.kind`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Note => "note",
        }
    }

    /// Parses the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "folder" => Some(Self::Folder),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

/// One folder or note in the notebook hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookItem {
    pub item_uuid: ItemId,
    /// `None` only for the root folder.
    pub parent_uuid: Option<ItemId>,
    pub display_name: String,
    pub kind: ItemKind,
    /// Nesting level; `0` for children of the root.
    pub depth: i32,
    /// Stable child order key within one parent.
    pub sort_order: i64,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
    /// Epoch ms update timestamp.
    pub updated_at: i64,
}

impl NotebookItem {
    /// Builds a new, not yet persisted child item.
    pub fn new_child(
        parent: &NotebookItem,
        kind: ItemKind,
        display_name: impl Into<String>,
        depth: i32,
        sort_order: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            item_uuid: Uuid::new_v4(),
            parent_uuid: Some(parent.item_uuid),
            display_name: display_name.into(),
            kind,
            depth,
            sort_order,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_uuid.is_none()
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    pub fn is_note(&self) -> bool {
        self.kind == ItemKind::Note
    }
}

/// Current wall clock in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{ItemKind, NotebookItem, ROOT_DEPTH};
    use uuid::Uuid;

    fn root() -> NotebookItem {
        NotebookItem {
            item_uuid: Uuid::new_v4(),
            parent_uuid: None,
            display_name: "Notebook".to_string(),
            kind: ItemKind::Folder,
            depth: ROOT_DEPTH,
            sort_order: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn kind_round_trips_through_storage_text() {
        for kind in [ItemKind::Folder, ItemKind::Note] {
            assert_eq!(ItemKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemKind::parse("note_ref"), None);
    }

    #[test]
    fn new_child_links_parent_and_gets_fresh_id() {
        let parent = root();
        let child = NotebookItem::new_child(&parent, ItemKind::Note, "Draft", 0, 3, 42);
        assert_eq!(child.parent_uuid, Some(parent.item_uuid));
        assert_ne!(child.item_uuid, parent.item_uuid);
        assert_eq!(child.created_at, 42);
        assert!(child.is_note());
        assert!(parent.is_root());
    }
}
