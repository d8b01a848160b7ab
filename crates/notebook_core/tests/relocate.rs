mod common;

use common::{collect_phases, contents, coordinator, open_tree, seed};
use notebook_core::{
    AppSettings, LifecycleError, NotebookConfig, OperationPhase, SettingsStore, StorageError,
};

#[tokio::test(flavor = "multi_thread")]
async fn relocate_moves_active_store_and_keeps_old_copy() {
    let dir = tempfile::tempdir().unwrap();
    let old_root = dir.path().join("book");
    let new_root = dir.path().join("moved");
    let tree = open_tree(&old_root);
    let seeded = seed(&tree, dir.path());
    let expected = contents(&tree);

    let (phases, outcome) =
        collect_phases(coordinator(&tree).relocate(&new_root, false).unwrap()).await;
    let outcome = outcome.unwrap();

    assert_eq!(phases.last(), Some(&OperationPhase::Completed));
    assert!(phases.contains(&OperationPhase::Committing));
    assert_eq!(outcome.previous_root, old_root);
    assert_eq!(outcome.new_root, new_root);
    assert_eq!(tree.location(), new_root);
    assert!(old_root.join("notes.db").is_file());
    assert!(new_root
        .join("notes_media")
        .join(&seeded.image.file_name)
        .is_file());
    assert_eq!(contents(&tree), expected);

    // Edits after the move land in the new store only.
    tree.create_note(tree.root_id(), "After move").unwrap();
    let moved = contents(&tree);
    drop(tree);
    assert_eq!(contents(&open_tree(&new_root)), moved);
    assert_eq!(contents(&open_tree(&old_root)), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn relocate_onto_existing_notebook_needs_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    seed(&tree, dir.path());
    let expected = contents(&tree);
    let occupied = dir.path().join("occupied");
    {
        let other = open_tree(&occupied);
        other.create_note(other.root_id(), "Resident").unwrap();
    }
    let lifecycle = coordinator(&tree);

    let refused = lifecycle.relocate(&occupied, false).unwrap().wait().await;
    assert!(matches!(refused, Err(LifecycleError::Conflict(path)) if path == occupied));
    assert_eq!(tree.location(), dir.path().join("book"));

    lifecycle.relocate(&occupied, true).unwrap().wait().await.unwrap();
    assert_eq!(tree.location(), occupied);
    assert_eq!(contents(&tree), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn relocate_records_new_location_in_settings() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    let settings = SettingsStore::new(dir.path().join("settings.json"));
    let lifecycle = notebook_core::LifecycleCoordinator::new(
        std::sync::Arc::clone(&tree),
        &NotebookConfig::default(),
    )
    .with_settings(settings.clone());

    let mut before = AppSettings::new(tree.location());
    before.backup_location = Some(dir.path().join("backups"));
    before.last_auto_backup = Some(chrono::Utc::now());
    settings.save(&before).unwrap();

    let new_root = dir.path().join("elsewhere");
    lifecycle.relocate(&new_root, false).unwrap().wait().await.unwrap();

    let saved = settings.load().unwrap().unwrap();
    assert_eq!(saved.notebook_location, new_root);
    assert_eq!(saved.backup_location, before.backup_location);
    assert_eq!(saved.last_auto_backup, before.last_auto_backup);
}

#[tokio::test(flavor = "multi_thread")]
async fn relocate_rejects_current_or_nested_location() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");
    let tree = open_tree(&root);
    let lifecycle = coordinator(&tree);

    let same = lifecycle.relocate(&root, true).unwrap().wait().await;
    assert!(matches!(
        same,
        Err(LifecycleError::Storage(StorageError::InvalidData(_)))
    ));
    let nested = lifecycle
        .relocate(root.join("inner"), false)
        .unwrap()
        .wait()
        .await;
    assert!(matches!(
        nested,
        Err(LifecycleError::Storage(StorageError::InvalidData(_)))
    ));
    assert_eq!(tree.location(), root);
}
