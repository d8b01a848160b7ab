mod common;

use common::{collect_phases, contents, coordinator, open_tree, open_tree_with, seed};
use notebook_core::{
    LifecycleCoordinator, LifecycleError, NotebookConfig, OperationPhase,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread")]
async fn backup_then_restore_brings_back_tree_bodies_and_media() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    let seeded = seed(&tree, dir.path());
    let expected = contents(&tree);
    let lifecycle = coordinator(&tree);

    let (phases, outcome) =
        collect_phases(lifecycle.backup(dir.path().join("backups")).unwrap()).await;
    let outcome = outcome.unwrap();

    assert_eq!(
        phases,
        vec![
            OperationPhase::Preparing,
            OperationPhase::Transferring,
            OperationPhase::Verifying,
            OperationPhase::Committing,
            OperationPhase::Completed,
        ]
    );
    assert!(outcome.path.starts_with(dir.path().join("backups")));
    assert!(outcome
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("backup_"));
    assert_eq!(
        (
            outcome.manifest.folder_count,
            outcome.manifest.note_count,
            outcome.manifest.media_count
        ),
        (2, 2, 1)
    );
    assert!(outcome.path.join("manifest.json").is_file());
    assert!(outcome
        .path
        .join("notes_media")
        .join(&seeded.image.file_name)
        .is_file());

    tree.delete(seeded.work).unwrap();
    tree.create_note(tree.root_id(), "Written after backup").unwrap();
    assert_ne!(contents(&tree), expected);

    let restored = lifecycle
        .restore_from(outcome.path.join("manifest.json"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(restored.manifest, outcome.manifest);
    assert_eq!(contents(&tree), expected);
    assert_eq!(tree.note_media(seeded.plan).unwrap(), vec![seeded.image.clone()]);
    assert!(tree
        .location()
        .join("notes_media")
        .join(&seeded.image.file_name)
        .is_file());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_notebook_restores_into_fresh_notebook() {
    let dir = tempfile::tempdir().unwrap();
    let empty = open_tree(&dir.path().join("empty"));
    let backup = coordinator(&empty)
        .backup(dir.path().join("backups"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let fresh = open_tree(&dir.path().join("fresh"));
    fresh.create_note(fresh.root_id(), "Will vanish").unwrap();
    coordinator(&fresh)
        .restore_from(&backup.path)
        .unwrap()
        .wait()
        .await
        .unwrap();

    let snapshot = fresh.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.note_count(), 0);
    assert!(snapshot.root().is_root());
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_media_is_rejected_and_live_notebook_survives() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    let seeded = seed(&tree, dir.path());
    let lifecycle = coordinator(&tree);
    let backup = lifecycle
        .backup(dir.path().join("backups"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Same size, different bytes: only the content hash can tell.
    let media = backup.path.join("notes_media").join(&seeded.image.file_name);
    let mut bytes = fs::read(&media).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&media, bytes).unwrap();
    tree.create_note(tree.root_id(), "Keep me").unwrap();
    let before = contents(&tree);

    let (phases, result) = collect_phases(lifecycle.restore_from(&backup.path).unwrap()).await;

    assert!(matches!(result, Err(LifecycleError::Integrity(_))));
    assert_eq!(phases.last(), Some(&OperationPhase::Failed));
    assert!(!phases.contains(&OperationPhase::Committing));
    assert_eq!(contents(&tree), before);
    assert_eq!(staging_leftovers(&tree.location()), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn manifest_count_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    seed(&tree, dir.path());
    let lifecycle = coordinator(&tree);
    let backup = lifecycle
        .backup(dir.path().join("backups"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    let manifest_path = backup.path.join("manifest.json");
    let mut manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    manifest["note_count"] = serde_json::json!(7);
    fs::write(&manifest_path, manifest.to_string()).unwrap();

    let result = lifecycle.restore_from(&backup.path).unwrap().wait().await;

    assert!(matches!(result, Err(LifecycleError::Integrity(_))));
    assert_eq!(tree.snapshot().note_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_backup_source_fails_before_touching_store() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    seed(&tree, dir.path());
    let before = contents(&tree);

    let result = coordinator(&tree)
        .restore_from(dir.path().join("nowhere"))
        .unwrap()
        .wait()
        .await;

    assert!(matches!(result, Err(LifecycleError::Io { .. })));
    assert_eq!(contents(&tree), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_refuses_backup_deeper_than_limit() {
    let dir = tempfile::tempdir().unwrap();
    let deep = open_tree(&dir.path().join("deep"));
    let mut parent = deep.root_id();
    for name in ["A", "B", "C", "D"] {
        parent = deep.create_folder(parent, name).unwrap().item_uuid;
    }
    let backup = coordinator(&deep)
        .backup(dir.path().join("backups"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let config = NotebookConfig {
        max_depth: 2,
        ..NotebookConfig::default()
    };
    let shallow = open_tree_with(&dir.path().join("shallow"), &config);
    let result = LifecycleCoordinator::new(Arc::clone(&shallow), &config)
        .restore_from(&backup.path)
        .unwrap()
        .wait()
        .await;

    assert!(matches!(result, Err(LifecycleError::Integrity(_))));
    assert_eq!(shallow.snapshot().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_restore_and_keeps_live_store() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(&dir.path().join("book"));
    seed(&tree, dir.path());
    let lifecycle = coordinator(&tree);
    let backup = lifecycle
        .backup(dir.path().join("backups"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    tree.create_note(tree.root_id(), "Newer than backup").unwrap();
    let before = contents(&tree);

    lifecycle.shutdown();
    let (phases, result) = collect_phases(lifecycle.restore_from(&backup.path).unwrap()).await;

    assert!(matches!(result, Err(LifecycleError::Cancelled)));
    assert_eq!(phases.last(), Some(&OperationPhase::Cancelled));
    assert_eq!(contents(&tree), before);
    assert_eq!(staging_leftovers(&tree.location()), 0);
}

fn staging_leftovers(root: &Path) -> usize {
    fs::read_dir(root)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
        .count()
}
