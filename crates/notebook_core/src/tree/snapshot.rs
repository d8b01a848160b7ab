//! Immutable in-memory index of the item hierarchy.
//!
//! # Responsibility
//! - Answer structural queries (children, descendants, ancestry) without
//!   touching the record store.
//! - Validate that a set of persisted items forms one well-shaped tree.
//!
//! # Invariants
//! - The only source of truth for parentage is `NotebookItem::parent_uuid`;
//!   the children index is derived from it.
//! - Children are ordered by `sort_order ASC, item_uuid ASC`.

use crate::model::item::{ItemId, ItemKind, NotebookItem, ROOT_DEPTH};
use std::collections::{HashMap, VecDeque};

/// Validated view of all items of one notebook.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    root_uuid: ItemId,
    items: HashMap<ItemId, NotebookItem>,
    children: HashMap<ItemId, Vec<ItemId>>,
}

impl TreeSnapshot {
    /// Builds a snapshot, rejecting anything that is not a single rooted,
    /// acyclic tree with consistent depths.
    pub fn from_items(items: Vec<NotebookItem>) -> Result<Self, String> {
        let roots: Vec<&NotebookItem> = items.iter().filter(|item| item.is_root()).collect();
        let root_uuid = match roots.as_slice() {
            [root] => root.item_uuid,
            [] => return Err("no root folder".to_string()),
            _ => return Err(format!("{} root items", roots.len())),
        };

        let mut by_id = HashMap::with_capacity(items.len());
        for item in items {
            if let Some(duplicate) = by_id.insert(item.item_uuid, item) {
                return Err(format!("duplicate item id {}", duplicate.item_uuid));
            }
        }

        let snapshot = Self::index(root_uuid, by_id);
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn index(root_uuid: ItemId, items: HashMap<ItemId, NotebookItem>) -> Self {
        let mut snapshot = Self {
            root_uuid,
            items,
            children: HashMap::new(),
        };
        snapshot.rebuild_children();
        snapshot
    }

    fn validate(&self) -> Result<(), String> {
        let root = self.root();
        if !root.is_folder() || root.depth != ROOT_DEPTH {
            return Err("root must be a folder at the root depth".to_string());
        }
        for item in self.items.values() {
            let Some(parent_uuid) = item.parent_uuid else {
                continue;
            };
            let parent = self
                .items
                .get(&parent_uuid)
                .ok_or_else(|| format!("item {} has missing parent {parent_uuid}", item.item_uuid))?;
            if !parent.is_folder() {
                return Err(format!("item {} is nested under a note", item.item_uuid));
            }
            if item.depth != parent.depth + 1 {
                return Err(format!(
                    "item {} has depth {}, parent has {}",
                    item.item_uuid, item.depth, parent.depth
                ));
            }
        }
        // With single parents, reaching every item from the root rules out
        // cycles.
        let reachable = self.descendants(self.root_uuid).len();
        if reachable != self.items.len() {
            return Err(format!(
                "{} items are not reachable from the root",
                self.items.len() - reachable
            ));
        }
        Ok(())
    }

    fn rebuild_children(&mut self) {
        let mut children: HashMap<ItemId, Vec<ItemId>> = HashMap::new();
        for item in self.items.values() {
            if let Some(parent_uuid) = item.parent_uuid {
                children.entry(parent_uuid).or_default().push(item.item_uuid);
            }
        }
        for ids in children.values_mut() {
            ids.sort_by_key(|id| (self.items[id].sort_order, *id));
        }
        self.children = children;
    }

    pub fn root_uuid(&self) -> ItemId {
        self.root_uuid
    }

    pub fn root(&self) -> &NotebookItem {
        &self.items[&self.root_uuid]
    }

    pub fn get(&self, item_uuid: ItemId) -> Option<&NotebookItem> {
        self.items.get(&item_uuid)
    }

    pub fn contains(&self, item_uuid: ItemId) -> bool {
        self.items.contains_key(&item_uuid)
    }

    /// Ordered direct children; empty for notes and unknown ids.
    pub fn children(&self, item_uuid: ItemId) -> impl Iterator<Item = &NotebookItem> + '_ {
        self.children
            .get(&item_uuid)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotebookItem> + '_ {
        self.items.values()
    }

    /// Item count including the root.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` when only the root exists.
    pub fn is_empty(&self) -> bool {
        self.items.len() == 1
    }

    pub fn folder_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.is_folder() && !item.is_root())
            .count()
    }

    pub fn note_count(&self) -> usize {
        self.items.values().filter(|item| item.is_note()).count()
    }

    /// `item_uuid` and every descendant in breadth-first order.
    pub fn descendants(&self, item_uuid: ItemId) -> Vec<ItemId> {
        if !self.items.contains_key(&item_uuid) {
            return Vec::new();
        }
        let mut result = Vec::new();
        let mut queue = VecDeque::from([item_uuid]);
        while let Some(id) = queue.pop_front() {
            if result.len() > self.items.len() {
                break;
            }
            result.push(id);
            if let Some(ids) = self.children.get(&id) {
                queue.extend(ids.iter().copied());
            }
        }
        result
    }

    /// Levels below `item_uuid`; `0` for a leaf.
    pub fn subtree_height(&self, item_uuid: ItemId) -> u32 {
        let Some(top) = self.items.get(&item_uuid) else {
            return 0;
        };
        self.descendants(item_uuid)
            .iter()
            .filter_map(|id| self.items.get(id))
            .map(|item| (item.depth - top.depth) as u32)
            .max()
            .unwrap_or(0)
    }

    /// Deepest item depth; `ROOT_DEPTH` for an empty notebook.
    pub fn deepest_depth(&self) -> i32 {
        self.items
            .values()
            .map(|item| item.depth)
            .max()
            .unwrap_or(ROOT_DEPTH)
    }

    /// Whether `ancestor` is `item_uuid` itself or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: ItemId, item_uuid: ItemId) -> bool {
        let mut current = Some(item_uuid);
        let mut steps = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.items.len() {
                return false;
            }
            current = self.items.get(&id).and_then(|item| item.parent_uuid);
        }
        false
    }

    /// Display names from the root's child down to `item_uuid`.
    pub fn path_names(&self, item_uuid: ItemId) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = self.items.get(&item_uuid);
        while let Some(item) = current {
            if item.is_root() || names.len() > self.items.len() {
                break;
            }
            names.push(item.display_name.as_str());
            current = item.parent_uuid.and_then(|id| self.items.get(&id));
        }
        names.reverse();
        names
    }

    /// Sort key for a child appended under `parent_uuid`.
    pub fn next_sort_order(&self, parent_uuid: ItemId) -> i64 {
        self.children(parent_uuid)
            .map(|item| item.sort_order)
            .max()
            .map_or(0, |max| max + 1)
    }

    /// Sorted `(path, kind)` pairs of every non-root item. Two notebooks with
    /// equal outlines have the same shape regardless of ids.
    pub fn outline(&self) -> Vec<(Vec<String>, ItemKind)> {
        let mut outline: Vec<(Vec<String>, ItemKind)> = self
            .items
            .values()
            .filter(|item| !item.is_root())
            .map(|item| {
                let path = self
                    .path_names(item.item_uuid)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                (path, item.kind)
            })
            .collect();
        outline.sort_by(|a, b| a.0.cmp(&b.0).then((a.1 as u8).cmp(&(b.1 as u8))));
        outline
    }

    pub(crate) fn insert(&mut self, item: NotebookItem) {
        let item_uuid = item.item_uuid;
        let parent_uuid = item.parent_uuid;
        self.items.insert(item_uuid, item);
        if let Some(parent_uuid) = parent_uuid {
            let items = &self.items;
            let ids = self.children.entry(parent_uuid).or_default();
            ids.push(item_uuid);
            ids.sort_by_key(|id| (items[id].sort_order, *id));
        }
    }

    pub(crate) fn rename(&mut self, item_uuid: ItemId, display_name: &str, now_ms: i64) {
        if let Some(item) = self.items.get_mut(&item_uuid) {
            item.display_name = display_name.to_string();
            item.updated_at = now_ms;
        }
    }

    pub(crate) fn remove_subtree(&mut self, item_uuid: ItemId) -> Vec<ItemId> {
        let removed = self.descendants(item_uuid);
        for id in &removed {
            self.items.remove(id);
        }
        self.rebuild_children();
        removed
    }

    /// Reparents `item_uuid` and shifts its subtree by `depth_delta`.
    pub(crate) fn reparent(
        &mut self,
        item_uuid: ItemId,
        new_parent_uuid: ItemId,
        sort_order: i64,
        depth_delta: i32,
        now_ms: i64,
    ) {
        for id in self.descendants(item_uuid) {
            if let Some(item) = self.items.get_mut(&id) {
                item.depth += depth_delta;
            }
        }
        if let Some(item) = self.items.get_mut(&item_uuid) {
            item.parent_uuid = Some(new_parent_uuid);
            item.sort_order = sort_order;
            item.updated_at = now_ms;
        }
        self.rebuild_children();
    }

    pub(crate) fn touch(&mut self, item_uuid: ItemId, now_ms: i64) {
        if let Some(item) = self.items.get_mut(&item_uuid) {
            item.updated_at = now_ms;
        }
    }
}
