use notebook_core::db::migrations::latest_version;
use notebook_core::db::{open_db, open_db_in_memory, open_reader, DbError};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "items");
    assert_table_exists(&conn, "note_contents");
    assert_table_exists(&conn, "media_assets");
    assert_table_exists(&conn, "note_media");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "items");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn schema_allows_only_one_root_row() {
    let conn = open_db_in_memory().unwrap();
    conn.execute(
        "INSERT INTO items (item_uuid, kind, parent_uuid, display_name, depth)
         VALUES ('root-a', 'folder', NULL, '', -1);",
        [],
    )
    .unwrap();

    let second = conn.execute(
        "INSERT INTO items (item_uuid, kind, parent_uuid, display_name, depth)
         VALUES ('root-b', 'folder', NULL, '', -1);",
        [],
    );
    assert!(second.is_err());

    let bad_depth = conn.execute(
        "INSERT INTO items (item_uuid, kind, parent_uuid, display_name, depth)
         VALUES ('child', 'note', 'root-a', 'Child', -1);",
        [],
    );
    assert!(bad_depth.is_err());
}

#[test]
fn deleting_a_note_drops_its_body_and_media_links() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO items (item_uuid, kind, parent_uuid, display_name, depth)
         VALUES ('root', 'folder', NULL, '', -1);
         INSERT INTO items (item_uuid, kind, parent_uuid, display_name, depth)
         VALUES ('note', 'note', 'root', 'Note', 0);
         INSERT INTO note_contents (item_uuid, body) VALUES ('note', 'hello');
         INSERT INTO media_assets (media_id, file_name, byte_len) VALUES ('m1', 'm1.png', 3);
         INSERT INTO note_media (item_uuid, media_id) VALUES ('note', 'm1');
         DELETE FROM items WHERE item_uuid = 'note';",
    )
    .unwrap();

    assert_eq!(count(&conn, "note_contents"), 0);
    assert_eq!(count(&conn, "note_media"), 0);
    assert_eq!(count(&conn, "media_assets"), 1);
}

#[test]
fn reader_connection_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let _writer = open_db(&path).unwrap();

    let reader = open_reader(&path).unwrap();
    assert_eq!(schema_version(&reader), latest_version());
    assert!(reader.execute("DELETE FROM items;", []).is_err());
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
