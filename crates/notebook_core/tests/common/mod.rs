#![allow(dead_code)]

use notebook_core::{
    ItemId, LifecycleCoordinator, MediaAsset, NotebookConfig, NotebookTree, OperationHandle,
    OperationPhase,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub fn open_tree(root: &Path) -> Arc<NotebookTree> {
    open_tree_with(root, &NotebookConfig::default())
}

pub fn open_tree_with(root: &Path, config: &NotebookConfig) -> Arc<NotebookTree> {
    Arc::new(NotebookTree::open(root, config).unwrap())
}

pub fn coordinator(tree: &Arc<NotebookTree>) -> LifecycleCoordinator {
    LifecycleCoordinator::new(Arc::clone(tree), &NotebookConfig::default())
}

/// Handles of the small notebook built by `seed`.
pub struct Seeded {
    pub work: ItemId,
    pub plan: ItemId,
    pub ideas: ItemId,
    pub archive: ItemId,
    pub image: MediaAsset,
}

/// Builds `Work/Plan` (with an image), `Ideas` and an empty `Work/Archive`.
pub fn seed(tree: &NotebookTree, scratch: &Path) -> Seeded {
    let root = tree.root_id();
    let work = tree.create_folder(root, "Work").unwrap().item_uuid;
    let archive = tree.create_folder(work, "Archive").unwrap().item_uuid;
    let plan = tree.create_note(work, "Plan").unwrap().item_uuid;
    tree.set_note_body(plan, "1. write tests\n2. ship").unwrap();
    let ideas = tree.create_note(root, "Ideas").unwrap().item_uuid;
    tree.set_note_body(ideas, "<b>bold</b> & more").unwrap();

    let image_path = scratch.join("diagram.png");
    write_file(&image_path, b"\x89PNG fake image bytes");
    let image = tree.attach_media(plan, &image_path).unwrap();
    Seeded {
        work,
        plan,
        ideas,
        archive,
        image,
    }
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

/// Outline plus every note body, keyed by path.
pub fn contents(tree: &NotebookTree) -> Vec<(Vec<String>, Option<String>)> {
    let snapshot = tree.snapshot();
    let mut contents: Vec<_> = snapshot
        .iter()
        .filter(|item| !item.is_root())
        .map(|item| {
            let path = snapshot
                .path_names(item.item_uuid)
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            let body = item
                .is_note()
                .then(|| tree.note_body(item.item_uuid).unwrap());
            (path, body)
        })
        .collect();
    contents.sort();
    contents
}

/// Waits for `handle` and returns the phases it reported.
pub async fn collect_phases<T>(
    handle: OperationHandle<T>,
) -> (Vec<OperationPhase>, notebook_core::LifecycleResult<T>) {
    let mut phases = Vec::new();
    let result = handle
        .wait_with_progress(|progress| {
            if phases.last() != Some(&progress.phase) {
                phases.push(progress.phase);
            }
        })
        .await;
    (phases, result)
}
