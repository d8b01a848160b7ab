use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn notebook(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("notebook").unwrap();
    cmd.arg("--notebook").arg(root);
    cmd
}

#[test]
fn builds_and_prints_a_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");

    notebook(&root)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("notebook ready at"));
    notebook(&root).args(["mkdir", "Work"]).assert().success();
    notebook(&root)
        .args(["new-note", "Work/Plan", "--body", "ship it"])
        .assert()
        .success();
    notebook(&root).args(["new-note", "Ideas"]).assert().success();

    notebook(&root)
        .arg("tree")
        .assert()
        .success()
        .stdout("Ideas\nWork/\n  Plan\n");
    notebook(&root)
        .args(["show", "Work/Plan"])
        .assert()
        .success()
        .stdout("ship it");
}

#[test]
fn unknown_path_fails_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");

    notebook(&root)
        .args(["new-note", "Missing/Plan"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no item named `Missing`"));
}

#[test]
fn backup_reports_phases_and_location() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");
    notebook(&root).args(["new-note", "Only"]).assert().success();

    notebook(&root)
        .arg("backup")
        .arg(dir.path().join("backups"))
        .assert()
        .success()
        .stdout(predicate::str::contains("backup written to"))
        .stderr(predicate::str::contains("backup: completed"));
}

#[test]
fn location_comes_from_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");
    let settings = dir.path().join("settings.json");

    notebook(&root)
        .arg("--settings")
        .arg(&settings)
        .arg("init")
        .assert()
        .success();
    Command::cargo_bin("notebook")
        .unwrap()
        .arg("--settings")
        .arg(&settings)
        .args(["mkdir", "Saved"])
        .assert()
        .success();

    notebook(&root)
        .arg("tree")
        .assert()
        .success()
        .stdout("Saved/\n");
}

#[test]
fn missing_location_is_an_error() {
    Command::cargo_bin("notebook")
        .unwrap()
        .arg("tree")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no notebook location"));
}

#[test]
fn auto_backup_runs_when_due_then_waits_for_the_interval() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");
    let settings = dir.path().join("settings.json");
    let backups = dir.path().join("backups");
    notebook(&root)
        .arg("--settings")
        .arg(&settings)
        .args(["new-note", "Only"])
        .assert()
        .success();

    notebook(&root)
        .arg("--settings")
        .arg(&settings)
        .arg("auto-backup")
        .arg(&backups)
        .assert()
        .success()
        .stdout(predicate::str::contains("auto_backup_"));
    notebook(&root)
        .arg("--settings")
        .arg(&settings)
        .arg("auto-backup")
        .arg(&backups)
        .assert()
        .success()
        .stdout("no backup due\n");
}
